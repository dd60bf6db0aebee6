// src/provider/ops.rs

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tonic::transport::Channel;

use crate::error::{OpsError, ProviderError};
use crate::model::{LocalModule, ModuleState, OperationKind, OperationResult, Platform};
use crate::pb;
use crate::pb::module_manager_client::ModuleManagerClient;
use crate::provider::PrivilegeState;
use crate::repo::LocalStore;

const OUTCOME_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

/// Transition policy, enforced at the interface so no call site can slip a
/// request past the backend-conditional rules.
pub(crate) fn check_transition(
    id: &str,
    from: ModuleState,
    op: OperationKind,
    platform: Platform,
) -> Result<(), OpsError> {
    match (op, from) {
        (OperationKind::Enable, ModuleState::Disable) => Ok(()),
        (OperationKind::Enable, ModuleState::Remove) if !platform.is_exclusive() => Ok(()),
        (OperationKind::Enable, ModuleState::Remove) => {
            Err(OpsError::RestoreUnsupported(id.to_string()))
        }
        (OperationKind::Disable, ModuleState::Enable) => Ok(()),
        (OperationKind::Remove, ModuleState::Enable | ModuleState::Disable) => Ok(()),
        _ => Err(OpsError::IllegalTransition {
            id: id.to_string(),
            from,
            op,
        }),
    }
}

enum Outcome {
    Success { id: String },
    Failure { id: String, message: Option<String> },
}

struct Tracker {
    busy: Mutex<HashSet<String>>,
    events: broadcast::Sender<OperationResult>,
}

impl Tracker {
    fn try_begin(&self, id: &str) -> Result<(), OpsError> {
        let mut busy = self.busy.lock().unwrap();
        if !busy.insert(id.to_string()) {
            return Err(OpsError::Busy(id.to_string()));
        }
        Ok(())
    }

    fn is_busy(&self, id: &str) -> bool {
        self.busy.lock().unwrap().contains(id)
    }

    fn pending(&self) -> usize {
        self.busy.lock().unwrap().len()
    }

    /// Removes the id. False means another path already resolved it, and
    /// the caller must not emit a second result for it.
    fn release(&self, id: &str) -> bool {
        self.busy.lock().unwrap().remove(id)
    }

    fn drain(&self) -> Vec<String> {
        self.busy.lock().unwrap().drain().collect()
    }
}

/// Privileged module operations with client-side tracking: at most one
/// in-flight operation per module id, the id marked busy before the call is
/// dispatched, and the authoritative record refreshed before the id is
/// released again.
#[derive(Clone)]
pub struct ModuleOps {
    client: ModuleManagerClient<Channel>,
    platform: Platform,
    state: watch::Receiver<PrivilegeState>,
    outcome_tx: mpsc::Sender<Outcome>,
    tracker: Arc<Tracker>,
}

impl ModuleOps {
    pub(crate) fn new(
        channel: Channel,
        platform: Platform,
        store: Arc<dyn LocalStore>,
        state: watch::Receiver<PrivilegeState>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let tracker = Arc::new(Tracker {
            busy: Mutex::new(HashSet::new()),
            events,
        });

        tokio::spawn(track_outcomes(
            outcome_rx,
            tracker.clone(),
            ModuleManagerClient::new(channel.clone()),
            store,
        ));

        Self {
            client: ModuleManagerClient::new(channel),
            platform,
            state,
            outcome_tx,
            tracker,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Submits one state transition. The id is busy from the moment this
    /// returns `Ok`; exactly one `OperationResult` will follow on the event
    /// channel. A second submission for a busy id is rejected.
    pub fn submit(&self, id: &str, from: ModuleState, op: OperationKind) -> Result<(), OpsError> {
        if *self.state.borrow() != PrivilegeState::Succeeded {
            return Err(OpsError::NotAlive);
        }
        check_transition(id, from, op, self.platform)?;
        // Busy before dispatch: a fast result can never outrun the marker.
        self.tracker.try_begin(id)?;

        let mut client = self.client.clone();
        let outcome_tx = self.outcome_tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let request = pb::ModuleIdRequest { id: id.clone() };
            let reply = match op {
                OperationKind::Enable => client.enable(request).await,
                OperationKind::Disable => client.disable(request).await,
                OperationKind::Remove => client.remove(request).await,
            };

            let outcome = match reply {
                Ok(reply) => {
                    let reply = reply.into_inner();
                    if reply.ok {
                        Outcome::Success { id }
                    } else {
                        let message = (!reply.error.is_empty()).then_some(reply.error);
                        Outcome::Failure { id, message }
                    }
                }
                Err(status) => Outcome::Failure {
                    id,
                    message: Some(status.message().to_string()),
                },
            };

            // A closed receiver means the bind was torn down; the
            // force-fail path has already resolved this id.
            let _ = outcome_tx.send(outcome).await;
        });
        Ok(())
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.tracker.is_busy(id)
    }

    /// True while any operation is in flight. Drives the UI-facing
    /// "something is running" signal.
    pub fn has_pending(&self) -> bool {
        self.tracker.pending() > 0
    }

    /// Terminal results, in delivery order. Subscribe before submitting to
    /// observe every result of subsequently accepted requests.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationResult> {
        self.tracker.events.subscribe()
    }

    /// Resolves every tracked id with a synthesized failure. Invoked on
    /// disconnection, where the helper will never answer; the pending
    /// entries would otherwise stay busy forever.
    pub(crate) fn fail_all_pending(&self, message: &str) {
        for id in self.tracker.drain() {
            tracing::warn!("{}: {}", id, message);
            let _ = self.tracker.events.send(OperationResult::Failure {
                id,
                message: Some(message.to_string()),
            });
        }
    }

    pub(crate) async fn fetch(&self, id: &str) -> Result<LocalModule, ProviderError> {
        let mut client = self.client.clone();
        let reply = client
            .get_module(pb::ModuleIdRequest { id: id.to_string() })
            .await?;
        reply
            .into_inner()
            .module
            .map(Into::into)
            .ok_or_else(|| ProviderError::Transport(tonic::Status::internal("empty module record")))
    }

    pub(crate) async fn fetch_all(&self) -> Result<Vec<LocalModule>, ProviderError> {
        let mut client = self.client.clone();
        let reply = client.list_modules(pb::ListModulesRequest {}).await?;
        Ok(reply
            .into_inner()
            .modules
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

async fn track_outcomes(
    mut outcomes: mpsc::Receiver<Outcome>,
    tracker: Arc<Tracker>,
    mut client: ModuleManagerClient<Channel>,
    store: Arc<dyn LocalStore>,
) {
    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            Outcome::Success { id } => {
                if !tracker.is_busy(&id) {
                    continue;
                }
                // Refresh the authoritative record before releasing the id;
                // observers must never see idle next to a stale record.
                match client
                    .get_module(pb::ModuleIdRequest { id: id.clone() })
                    .await
                {
                    Ok(reply) => {
                        if let Some(info) = reply.into_inner().module {
                            store.upsert(info.into()).await;
                        }
                    }
                    Err(status) => {
                        tracing::warn!("refresh of '{}' failed: {}", id, status.message());
                    }
                }
                if tracker.release(&id) {
                    let _ = tracker.events.send(OperationResult::Success { id });
                }
            }
            Outcome::Failure { id, message } => {
                tracing::warn!(
                    "{}: {}",
                    id,
                    message.as_deref().unwrap_or("operation failed")
                );
                if tracker.release(&id) {
                    let _ = tracker.events.send(OperationResult::Failure { id, message });
                }
            }
        }
    }
}
