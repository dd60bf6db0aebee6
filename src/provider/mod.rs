// src/provider/mod.rs

pub mod connector;
pub mod fs;
pub mod ops;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ProviderError;
use crate::model::{LocalModule, Platform};
use crate::repo::LocalStore;
use connector::{bind, Handles, HelperLauncher};
use fs::RemoteFileSystem;
use ops::ModuleOps;

/// Privilege lifecycle of the provider. Starts at `None`; each bind attempt
/// ends in exactly one terminal transition. There is no automatic retry;
/// a new attempt takes another `init` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeState {
    None,
    Succeeded,
    Failed,
}

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub socket_path: PathBuf,
    /// Helper binary the launcher hands to su.
    pub helper_path: PathBuf,
    /// Bounds the whole acquire-launch-dial-handshake sequence.
    pub startup_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            helper_path: PathBuf::from("/data/adb/rootmod/rootmodd"),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

/// Access point for everything privileged: lifecycle state, the remote file
/// system, and module operations. An explicit context object constructed at
/// the composition root and handed to consumers; re-initialized in place
/// after failures.
pub struct Provider {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProviderConfig,
    launcher: Arc<dyn HelperLauncher>,
    store: Arc<dyn LocalStore>,
    generation: AtomicU64,
    state_tx: watch::Sender<PrivilegeState>,
    state_rx: watch::Receiver<PrivilegeState>,
    handles: RwLock<Option<Handles>>,
}

impl Provider {
    pub fn new(
        config: ProviderConfig,
        launcher: Arc<dyn HelperLauncher>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PrivilegeState::None);
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                store,
                generation: AtomicU64::new(0),
                state_tx,
                state_rx,
                handles: RwLock::new(None),
            }),
        }
    }

    /// Starts a bind attempt and returns immediately; the caller's thread
    /// never blocks. Progress is published on the state channel, and at
    /// most one terminal event per attempt is acted upon.
    pub fn init(&self) {
        let inner = self.inner.clone();
        let generation = {
            // Bump, discard, and publish under the handle lock, so an older
            // attempt finishing late can neither install its handles over
            // this one nor publish a stale lifecycle event after ours.
            let mut handles = inner.handles.write().unwrap();
            *handles = None;
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = inner.state_tx.send(PrivilegeState::None);
            generation
        };
        tracing::debug!("provider init (generation {})", generation);

        tokio::spawn(async move {
            Inner::attempt(inner, generation).await;
        });
    }

    pub fn state(&self) -> PrivilegeState {
        *self.inner.state_rx.borrow()
    }

    /// Subscription to lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<PrivilegeState> {
        self.inner.state_rx.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == PrivilegeState::Succeeded
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.handles.read().unwrap().is_some()
    }

    fn handles(&self) -> Result<Handles, ProviderError> {
        self.inner
            .handles
            .read()
            .unwrap()
            .clone()
            .ok_or(ProviderError::NotInitialized)
    }

    /// The helper's sanitized security-context label, captured at bind.
    pub fn context(&self) -> Result<String, ProviderError> {
        Ok(self.handles()?.context)
    }

    pub fn platform(&self) -> Result<Platform, ProviderError> {
        Ok(self.handles()?.platform)
    }

    /// False whenever the provider is down; callers gate staged-removal
    /// reversal on this without having to branch on lifecycle state.
    pub fn is_exclusive_backend(&self) -> bool {
        self.is_alive()
            && self
                .handles()
                .map(|h| h.platform.is_exclusive())
                .unwrap_or(false)
    }

    pub fn fs(&self) -> Result<RemoteFileSystem, ProviderError> {
        Ok(self.handles()?.fs)
    }

    pub fn ops(&self) -> Result<ModuleOps, ProviderError> {
        Ok(self.handles()?.ops)
    }

    pub fn store(&self) -> Arc<dyn LocalStore> {
        self.inner.store.clone()
    }

    /// Refreshes one module's authoritative record into the store.
    pub async fn refresh(&self, id: &str) -> Result<LocalModule, ProviderError> {
        let ops = self.ops()?;
        let module = ops.fetch(id).await?;
        self.inner.store.upsert(module.clone()).await;
        Ok(module)
    }

    /// Refreshes every installed module's record into the store.
    pub async fn refresh_all(&self) -> Result<Vec<LocalModule>, ProviderError> {
        let ops = self.ops()?;
        let modules = ops.fetch_all().await?;
        self.inner.store.replace_all(modules.clone()).await;
        Ok(modules)
    }
}

impl Inner {
    async fn attempt(inner: Arc<Inner>, generation: u64) {
        let result = bind(
            &inner.config,
            &inner.launcher,
            inner.store.clone(),
            inner.state_rx.clone(),
        )
        .await;

        match result {
            Ok((handles, heartbeat)) => {
                {
                    let mut slot = inner.handles.write().unwrap();
                    if inner.generation.load(Ordering::SeqCst) != generation {
                        // Superseded by a newer init; this attempt's event
                        // is no longer authoritative.
                        return;
                    }
                    *slot = Some(handles);
                    let _ = inner.state_tx.send(PrivilegeState::Succeeded);
                }
                tracing::info!("provider bound (generation {})", generation);

                tokio::spawn(Inner::watch_helper(inner, generation, heartbeat));
            }
            Err(e) => {
                let slot = inner.handles.write().unwrap();
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let _ = inner.state_tx.send(PrivilegeState::Failed);
                drop(slot);
                tracing::warn!("bind attempt {} failed: {}", generation, e);
            }
        }
    }

    /// Holds the heartbeat stream for the life of the bind. Its end, for
    /// whatever reason, is the disconnection event.
    async fn watch_helper(
        inner: Arc<Inner>,
        generation: u64,
        mut heartbeat: tonic::Streaming<crate::pb::Heartbeat>,
    ) {
        loop {
            match heartbeat.message().await {
                Ok(Some(_beat)) => continue,
                Ok(None) | Err(_) => break,
            }
        }

        {
            let mut slot = inner.handles.write().unwrap();
            if inner.generation.load(Ordering::SeqCst) != generation {
                // A newer bind owns the lifecycle now.
                return;
            }
            if let Some(handles) = slot.take() {
                // Pending operations will never get an answer from a dead
                // helper; resolve them here instead of leaving them busy
                // forever.
                handles
                    .ops
                    .fail_all_pending(&ProviderError::Disconnected.to_string());
            }
            let _ = inner.state_tx.send(PrivilegeState::Failed);
        }
        tracing::warn!("helper disconnected (generation {})", generation);
    }
}
