// tests/provider.rs
//
// End-to-end coverage of the privileged provider against the real daemon
// services, served in-process over a throwaway Unix socket with a
// marker-file module tree. No root is required: the launcher seam is
// filled with stubs, which is exactly the production wiring minus su.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;

use rootmod::agent::config::AgentConfig;
use rootmod::agent::server;
use rootmod::agent::sys::magisk::MagiskBackend;
use rootmod::agent::sys::traits::ModuleBackend;
use rootmod::error::{OpsError, ProviderError};
use rootmod::model::{LocalModule, ModuleState, OperationKind, OperationResult, Platform};
use rootmod::provider::connector::HelperLauncher;
use rootmod::provider::{PrivilegeState, Provider, ProviderConfig};
use rootmod::repo::{LocalStore, MemoryStore};

const WAIT: Duration = Duration::from_secs(5);

// ==============================================================================
// Fixtures
// ==============================================================================

struct NoopLauncher;

#[async_trait]
impl HelperLauncher for NoopLauncher {
    async fn launch(&self, _config: &ProviderConfig) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct DenyLauncher;

#[async_trait]
impl HelperLauncher for DenyLauncher {
    async fn launch(&self, _config: &ProviderConfig) -> Result<(), ProviderError> {
        Err(ProviderError::PrivilegeDenied)
    }
}

/// Backend whose mutations never finish, for pending-operation teardown.
struct StuckBackend;

#[async_trait]
impl ModuleBackend for StuckBackend {
    fn kind(&self) -> Platform {
        Platform::Magisk
    }

    async fn list(&self) -> Result<Vec<LocalModule>, String> {
        Ok(Vec::new())
    }

    async fn get(&self, id: &str) -> Result<LocalModule, String> {
        Err(format!("module '{}' is not installed", id))
    }

    async fn enable(&self, _id: &str) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn disable(&self, _id: &str) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn write_module(modules_dir: &Path, id: &str, markers: &[&str]) {
    let dir = modules_dir.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("module.prop"),
        format!("id={id}\nname=Example {id}\nversion=v1.0\nversionCode=100\nauthor=tester\n"),
    )
    .unwrap();
    for marker in markers {
        std::fs::write(dir.join(marker), b"").unwrap();
    }
}

struct Daemon {
    socket_path: PathBuf,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

fn start_daemon(backend: Arc<dyn ModuleBackend>) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("daemon.sock");

    let config = AgentConfig {
        socket_path: socket_path.display().to_string(),
        modules_dir: String::new(),
        expected_caller_uid: nix::unistd::getuid().as_raw(),
        platform_override: None,
    };

    let uds = UnixListener::bind(&socket_path).unwrap();
    let incoming = UnixListenerStream::new(uds);
    let handle = tokio::spawn(async move {
        let _ = server::router(&config, backend)
            .serve_with_incoming(incoming)
            .await;
    });

    Daemon {
        socket_path,
        handle,
        _dir: dir,
    }
}

fn provider_for(socket_path: &Path, launcher: Arc<dyn HelperLauncher>) -> (Provider, Arc<MemoryStore>) {
    let mut config = ProviderConfig::new(socket_path);
    config.startup_timeout = Duration::from_secs(2);
    let store = Arc::new(MemoryStore::new());
    (Provider::new(config, launcher, store.clone()), store)
}

async fn wait_for_state(provider: &Provider, want: PrivilegeState) {
    let mut rx = provider.state_changes();
    tokio::time::timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never reached {:?}", want));
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<OperationResult>,
) -> OperationResult {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no operation result in time")
        .expect("event channel closed")
}

// ==============================================================================
// Lifecycle
// ==============================================================================

#[tokio::test]
async fn happy_path_binds_and_exposes_handles() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &[]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    assert!(provider.is_alive());
    assert!(provider.is_initialized());
    assert_eq!(provider.platform().unwrap(), Platform::Magisk);
    assert!(!provider.is_exclusive_backend());

    // The context label is sanitized on the daemon side; whatever the host
    // kernel reports, nothing outside the allow-list may come through.
    let context = provider.context().unwrap();
    assert!(
        context
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, ':' | '_' | ',')),
        "unsanitized context {context:?}"
    );

    let fs = provider.fs().unwrap();
    let stat = fs
        .stat(&modules.path().join("mod.a/module.prop").display().to_string())
        .await
        .unwrap();
    assert!(stat.exists);
    assert!(!stat.is_dir);

    let listed = provider.refresh_all().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "mod.a");
    assert_eq!(listed[0].state, ModuleState::Enable);
}

#[tokio::test]
async fn absent_helper_fails_within_the_startup_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-home.sock");

    let (provider, _store) = provider_for(&socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Failed).await;

    assert!(!provider.is_alive());
    assert!(!provider.is_initialized());
    assert!(matches!(provider.fs(), Err(ProviderError::NotInitialized)));
    assert!(matches!(provider.ops(), Err(ProviderError::NotInitialized)));
    assert!(matches!(provider.context(), Err(ProviderError::NotInitialized)));
}

#[tokio::test]
async fn rejected_privilege_surfaces_as_failed_state() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("denied.sock");

    let (provider, _store) = provider_for(&socket_path, Arc::new(DenyLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Failed).await;

    assert!(!provider.is_alive());
    assert!(!provider.is_initialized());
}

#[tokio::test]
async fn reinit_after_failure_can_succeed() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &[]);

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("late.sock");

    let (provider, _store) = provider_for(&socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Failed).await;

    // The helper shows up afterwards; a fresh init must fully rebuild.
    let backend: Arc<dyn ModuleBackend> = Arc::new(MagiskBackend::new(modules.path()));
    let config = AgentConfig {
        socket_path: socket_path.display().to_string(),
        modules_dir: String::new(),
        expected_caller_uid: nix::unistd::getuid().as_raw(),
        platform_override: None,
    };
    let uds = UnixListener::bind(&socket_path).unwrap();
    let incoming = UnixListenerStream::new(uds);
    let _server = tokio::spawn(async move {
        let _ = server::router(&config, backend)
            .serve_with_incoming(incoming)
            .await;
    });

    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;
    assert!(provider.is_alive());
    assert!(provider.is_initialized());
}

#[tokio::test]
async fn overlapping_inits_settle_on_one_authoritative_bind() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &[]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    provider.init();
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    // Whatever the interleaving, the surviving handles must belong to a
    // single usable bind.
    assert!(provider.is_alive());
    let ops = provider.ops().unwrap();
    assert_eq!(ops.platform(), Platform::Magisk);
    assert!(provider.refresh("mod.a").await.is_ok());
}

// ==============================================================================
// Module operations
// ==============================================================================

#[tokio::test]
async fn disable_marks_busy_refreshes_then_releases() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &[]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;
    provider.refresh_all().await.unwrap();

    let ops = provider.ops().unwrap();
    let mut events = ops.subscribe();

    ops.submit("mod.a", ModuleState::Enable, OperationKind::Disable)
        .unwrap();
    // Busy is marked synchronously with submission.
    assert!(ops.is_busy("mod.a"));
    assert!(ops.has_pending());

    let result = next_event(&mut events).await;
    assert_eq!(
        result,
        OperationResult::Success {
            id: "mod.a".to_string()
        }
    );

    // By the time the result is observable, the refreshed record is too.
    assert!(!ops.is_busy("mod.a"));
    assert_eq!(
        store.get("mod.a").await.unwrap().state,
        ModuleState::Disable
    );

    // Exactly one result per accepted request.
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn second_submission_for_a_busy_id_is_rejected() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &[]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    let ops = provider.ops().unwrap();
    let mut events = ops.subscribe();

    ops.submit("mod.a", ModuleState::Enable, OperationKind::Disable)
        .unwrap();
    let rejected = ops.submit("mod.a", ModuleState::Enable, OperationKind::Disable);
    assert!(matches!(rejected, Err(OpsError::Busy(_))));

    // The rejected submission produces no result of its own.
    let _ = next_event(&mut events).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
    assert!(!ops.is_busy("mod.a"));
}

#[tokio::test]
async fn illegal_transitions_are_rejected_before_dispatch() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &["disable"]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    let ops = provider.ops().unwrap();
    let err = ops
        .submit("mod.a", ModuleState::Disable, OperationKind::Disable)
        .unwrap_err();
    assert!(matches!(err, OpsError::IllegalTransition { .. }));
    assert!(!ops.is_busy("mod.a"));
}

#[tokio::test]
async fn enable_reverses_a_staged_removal_on_magisk() {
    let modules = tempfile::tempdir().unwrap();
    write_module(modules.path(), "mod.a", &["remove"]);
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;
    provider.refresh_all().await.unwrap();

    let ops = provider.ops().unwrap();
    let mut events = ops.subscribe();
    ops.submit("mod.a", ModuleState::Remove, OperationKind::Enable)
        .unwrap();

    assert!(next_event(&mut events).await.is_success());
    assert_eq!(store.get("mod.a").await.unwrap().state, ModuleState::Enable);
}

#[tokio::test]
async fn operation_failures_release_the_id_with_a_message() {
    let modules = tempfile::tempdir().unwrap();
    // No module on disk: the daemon will refuse the mutation.
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    let ops = provider.ops().unwrap();
    let mut events = ops.subscribe();
    ops.submit("ghost", ModuleState::Enable, OperationKind::Disable)
        .unwrap();

    match next_event(&mut events).await {
        OperationResult::Failure { id, message } => {
            assert_eq!(id, "ghost");
            assert!(message.unwrap().contains("not installed"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!ops.is_busy("ghost"));
}

// ==============================================================================
// Disconnection
// ==============================================================================

#[tokio::test]
async fn helper_death_fails_the_provider_and_pending_operations() {
    let daemon = start_daemon(Arc::new(StuckBackend));

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    let ops = provider.ops().unwrap();
    let fs = provider.fs().unwrap();
    let mut events = ops.subscribe();

    ops.submit("mod.a", ModuleState::Enable, OperationKind::Disable)
        .unwrap();
    assert!(ops.is_busy("mod.a"));

    daemon.handle.abort();
    wait_for_state(&provider, PrivilegeState::Failed).await;

    // Pending entries are failed on disconnection instead of staying busy
    // forever. Whether the forced failure or the dying call's transport
    // error wins the race, exactly one failure is attributed to the request.
    match next_event(&mut events).await {
        OperationResult::Failure { id, message } => {
            assert_eq!(id, "mod.a");
            assert!(message.is_some());
        }
        other => panic!("expected forced failure, got {other:?}"),
    }
    assert!(!ops.is_busy("mod.a"));
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // All handles are gone or hard-failing now.
    assert!(!provider.is_alive());
    assert!(!provider.is_initialized());
    assert!(matches!(provider.fs(), Err(ProviderError::NotInitialized)));
    assert!(matches!(fs.stat("/").await, Err(ProviderError::NotAlive)));
    assert!(matches!(
        ops.submit("mod.b", ModuleState::Enable, OperationKind::Disable),
        Err(OpsError::NotAlive)
    ));
}

// ==============================================================================
// Remote file system
// ==============================================================================

#[tokio::test]
async fn remote_file_system_round_trips_content() {
    let modules = tempfile::tempdir().unwrap();
    let daemon = start_daemon(Arc::new(MagiskBackend::new(modules.path())));
    let scratch = tempfile::tempdir().unwrap();

    let (provider, _store) = provider_for(&daemon.socket_path, Arc::new(NoopLauncher));
    provider.init();
    wait_for_state(&provider, PrivilegeState::Succeeded).await;

    let fs = provider.fs().unwrap();
    let target = scratch.path().join("nested/config.txt").display().to_string();

    fs.write(&target, b"hello".to_vec(), "0600").await.unwrap();
    assert_eq!(fs.read(&target).await.unwrap(), b"hello");

    let stat = fs.stat(&target).await.unwrap();
    assert!(stat.exists);
    assert_eq!(stat.mode & 0o777, 0o600);
    assert_eq!(stat.size, 5);

    let entries = fs
        .list_dir(&scratch.path().join("nested").display().to_string())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "config.txt");

    fs.remove(&target).await.unwrap();
    assert!(!fs.stat(&target).await.unwrap().exists);
}
