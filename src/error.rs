//! Error taxonomy for the capture pipeline.
//!
//! - connection problems never show up here; they travel as `ConnectionState::Error` events
//! - `RemoteError` covers every call against the remote session service, uploads included
//! - `CaptureError` is what the orchestrator hands back to its caller

use thiserror::Error;

use crate::model::SessionId;
use crate::capture::orchestrator::Phase;

pub type RemoteResult<T> = Result<T, RemoteError>;
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Failure of a remote call (session lifecycle or sample upload).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("remote service unreachable: {0}")]
    Unreachable(String),

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote call timed out")]
    Timeout,

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("invalid session state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture session is already active")]
    AlreadyActive,

    #[error("no active capture session")]
    NoActiveSession,

    #[error("another transition is in progress ({0:?})")]
    TransitionInProgress(Phase),

    #[error("failed to create remote session: {0}")]
    CreateFailed(#[source] RemoteError),

    /// The remote finish call failed. The local session is closed anyway;
    /// `undelivered` counts samples still held by the buffer.
    #[error("failed to finish remote session ({undelivered} samples undelivered): {source}")]
    FinishFailed {
        #[source]
        source: RemoteError,
        undelivered: usize,
    },

    #[error("failed to abort remote session: {0}")]
    AbortFailed(#[source] RemoteError),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}
