// src/error.rs

use thiserror::Error;

use crate::model::{ModuleState, OperationKind};

/// Privilege-acquisition and binding failures surfaced by the connector and
/// the provider facade. All of these resolve to the FAILED lifecycle state;
/// none cross the provider boundary as panics.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("root privilege rejected or unavailable")]
    PrivilegeDenied,

    #[error("helper bind failed: {0}")]
    BindFailure(String),

    #[error("helper handshake failed: {0}")]
    Handshake(String),

    #[error("helper process disconnected")]
    Disconnected,

    #[error("provider is not initialized")]
    NotInitialized,

    #[error("provider is not alive")]
    NotAlive,

    #[error("remote file-system operation failed: {0}")]
    FileSystem(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),
}

/// Rejections raised at operation submission, before anything is dispatched
/// to the helper. In-flight failures travel as `OperationResult::Failure`
/// instead.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("an operation is already in flight for module {0}")]
    Busy(String),

    #[error("{op:?} is illegal from state {from:?} for module {id}")]
    IllegalTransition {
        id: String,
        from: ModuleState,
        op: OperationKind,
    },

    #[error("cannot restore module {0}: this backend does not reverse a staged removal")]
    RestoreUnsupported(String),

    #[error("provider is not alive")]
    NotAlive,
}
