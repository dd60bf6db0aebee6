// src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;

use rootmod::agent::config::AgentConfig;
use rootmod::agent::sys::traits::ModuleBackend;
use rootmod::agent::{select_backend, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    // Initialize structured logging
    tracing_subscriber::fmt::init();
    let config = AgentConfig::load();

    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("running without root; privileged operations will fail");
    }

    let socket_path = config.socket_path.clone();
    let socket_dir = Path::new(&socket_path)
        .parent()
        .ok_or("socket path has no parent directory")?;

    // ==============================================================================
    // 2. Secure Socket Initialization
    // ==============================================================================

    // Ensure the runtime directory exists
    if !socket_dir.exists() {
        fs::create_dir_all(socket_dir)?;
    }

    // Clean up an existing socket file from a previous crash/run
    if Path::new(&socket_path).exists() {
        fs::remove_file(&socket_path)?;
    }

    // Bind to the Unix Domain Socket
    let uds = UnixListener::bind(&socket_path)?;

    // Authorization happens in the peer-credential interceptor, not in the
    // socket mode bits; the file only needs to be reachable by the caller.
    let mut perms = fs::metadata(&socket_path)?.permissions();
    perms.set_mode(0o666);
    fs::set_permissions(&socket_path, perms)?;

    let uds_stream = UnixListenerStream::new(uds);

    // ==============================================================================
    // 3. Dependency Injection & Service Start
    // ==============================================================================

    let backend = select_backend(&config);
    tracing::info!(
        "rootmod daemon starting on {} ({:?} backend, caller uid {})",
        socket_path,
        backend.kind(),
        config.expected_caller_uid
    );

    server::router(&config, backend)
        .serve_with_incoming(uds_stream)
        .await?;

    Ok(())
}
