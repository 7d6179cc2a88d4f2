//! Remote session service as consumed by the capture core.
//!
//! Two narrow seams: the session lifecycle (create / finish / abort) and the
//! single-shot sample upload. Neither retries; retry policy belongs to the
//! orchestrator. Token attachment and transport are the implementor's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemoteResult;
use crate::model::{NewSession, Sample, Session, SessionId, SessionSummary};

pub mod memory;
pub mod wire;

pub use memory::InMemoryRemote;
pub use wire::UploadAck;

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates the remote record; the returned session carries the assigned id.
    async fn create_session(&self, request: &NewSession) -> RemoteResult<Session>;

    async fn finish_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
        summary: Option<SessionSummary>,
    ) -> RemoteResult<Session>;

    async fn abort_session(&self, id: &SessionId) -> RemoteResult<Session>;
}

/// Delivers one batch for one session. A failure means unreachable, rejected
/// or timed out; the caller keeps ownership of the batch either way.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn send(&self, session_id: &SessionId, samples: &[Sample]) -> RemoteResult<UploadAck>;
}
