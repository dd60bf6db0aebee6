// src/provider/connector.rs

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::ProviderError;
use crate::model::Platform;
use crate::pb;
use crate::pb::su_provider_client::SuProviderClient;
use crate::provider::fs::RemoteFileSystem;
use crate::provider::ops::ModuleOps;
use crate::provider::{PrivilegeState, ProviderConfig};
use crate::repo::LocalStore;

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Acquires a root execution context and starts the helper daemon.
/// Returning `Ok` means the helper is expected to come up on the socket
/// within the connector's startup window.
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    async fn launch(&self, config: &ProviderConfig) -> Result<(), ProviderError>;
}

/// Production launcher: everything root-side goes through `su` with
/// mount-namespace isolation and the helper's stderr folded into stdout.
pub struct SuLauncher;

#[async_trait]
impl HelperLauncher for SuLauncher {
    async fn launch(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        // Probe first: a rejected su prompt must fail the attempt before
        // the helper spawn is ever tried.
        let probe = Command::new("su")
            .args(["--mount-master", "-c", "id -u"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|_| ProviderError::PrivilegeDenied)?;
        let uid = String::from_utf8_lossy(&probe.stdout);
        if !probe.status.success() || uid.trim() != "0" {
            return Err(ProviderError::PrivilegeDenied);
        }

        let command = format!(
            "ROOTMOD_SOCKET_PATH='{}' exec '{}' 2>&1",
            config.socket_path.display(),
            config.helper_path.display()
        );
        let mut child = Command::new("su")
            .args(["--mount-master", "-c", &command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProviderError::BindFailure(format!("helper spawn: {}", e)))?;

        // Forward the helper's merged output into our own log stream.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "rootmod::helper", "{}", line);
                }
            });
        }

        tokio::spawn(async move {
            if let Ok(status) = child.wait().await {
                tracing::warn!("helper exited with {}", status);
            }
        });

        Ok(())
    }
}

/// The handle bundle one successful bind produces. Cloned out to callers;
/// discarded wholesale on teardown so nothing partially-bound survives.
#[derive(Clone)]
pub(crate) struct Handles {
    pub context: String,
    pub platform: Platform,
    pub fs: RemoteFileSystem,
    pub ops: ModuleOps,
}

/// One full bind attempt: launch, dial, handshake, handle construction.
/// Everything is bounded by the config's startup timeout; any failure
/// surfaces as one error with no partial state left behind.
pub(crate) async fn bind(
    config: &ProviderConfig,
    launcher: &Arc<dyn HelperLauncher>,
    store: Arc<dyn LocalStore>,
    state: watch::Receiver<PrivilegeState>,
) -> Result<(Handles, tonic::Streaming<pb::Heartbeat>), ProviderError> {
    let deadline = Instant::now() + config.startup_timeout;

    timeout_at(deadline, launcher.launch(config))
        .await
        .map_err(|_| ProviderError::BindFailure("helper startup timed out".to_string()))??;

    let channel = dial(&config.socket_path, deadline).await?;

    let mut su = SuProviderClient::new(channel.clone());

    let platform = timeout_at(deadline, su.get_platform(pb::GetPlatformRequest {}))
        .await
        .map_err(|_| ProviderError::BindFailure("handshake timed out".to_string()))??
        .into_inner()
        .platform();
    let platform = Platform::try_from(platform).map_err(ProviderError::Handshake)?;

    let context = timeout_at(deadline, su.get_context(pb::GetContextRequest {}))
        .await
        .map_err(|_| ProviderError::BindFailure("handshake timed out".to_string()))??
        .into_inner()
        .context;

    let heartbeat = su.watch(pb::WatchRequest {}).await?.into_inner();

    let fs = RemoteFileSystem::new(channel.clone(), state.clone());
    let ops = ModuleOps::new(channel, platform, store, state);

    Ok((
        Handles {
            context,
            platform,
            fs,
            ops,
        },
        heartbeat,
    ))
}

/// Dials the daemon socket, retrying until the deadline. The helper needs
/// a moment between spawn and listen, so refusal and absence both retry.
async fn dial(socket: &Path, deadline: Instant) -> Result<Channel, ProviderError> {
    loop {
        let path = socket.to_path_buf();
        // The URI is required by the endpoint API but never resolved; the
        // connector below supplies the actual transport.
        let attempt = Endpoint::try_from("http://[::1]:50051")
            .map_err(|e| ProviderError::BindFailure(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
            .await;

        match attempt {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                if Instant::now() + DIAL_RETRY_INTERVAL >= deadline {
                    return Err(ProviderError::BindFailure(format!(
                        "dial {}: {}",
                        socket.display(),
                        e
                    )));
                }
                sleep(DIAL_RETRY_INTERVAL).await;
            }
        }
    }
}
