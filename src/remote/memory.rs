//! memory.rs
//! In-process session service used by the demo binary and the tests.
//!
//! Behaves like the real service where the pipeline can tell the difference:
//! ids are assigned on create, finish/abort only apply to active sessions,
//! uploads are de-duplicated by sample id. Faults can be scripted per call.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{RemoteError, RemoteResult};
use crate::model::{NewSession, Sample, Session, SessionId, SessionSummary};
use crate::remote::wire::{CreateSamplesRequest, FinishSessionRequest, SampleDto, UploadAck};
use crate::remote::{SessionService, UploadClient};

#[derive(Default)]
struct Faults {
    create: Option<RemoteError>,
    finish: Option<RemoteError>,
    abort: Option<RemoteError>,
    uploads_to_fail: usize,
    fail_every: Option<u64>,
    fail_all_uploads: bool,
}

#[derive(Default)]
struct RemoteState {
    sessions: HashMap<SessionId, Session>,
    samples: HashMap<SessionId, Vec<SampleDto>>,
    seen: HashSet<Uuid>,
    batches: Vec<usize>,
    upload_calls: u64,
    bytes_received: usize,
    last_finish: Option<FinishSessionRequest>,
    faults: Faults,
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    upload_latency: Duration,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload sleeps this long before it is answered.
    pub fn with_upload_latency(mut self, latency: Duration) -> Self {
        self.upload_latency = latency;
        self
    }

    pub fn fail_next_create(&self, err: RemoteError) {
        self.state.lock().faults.create = Some(err);
    }

    pub fn fail_next_finish(&self, err: RemoteError) {
        self.state.lock().faults.finish = Some(err);
    }

    pub fn fail_next_abort(&self, err: RemoteError) {
        self.state.lock().faults.abort = Some(err);
    }

    pub fn fail_next_uploads(&self, count: usize) {
        self.state.lock().faults.uploads_to_fail = count;
    }

    /// Fails upload calls number n, 2n, 3n, ...
    pub fn fail_every_nth_upload(&self, n: u64) {
        self.state.lock().faults.fail_every = (n > 0).then_some(n);
    }

    pub fn fail_all_uploads(&self, on: bool) {
        self.state.lock().faults.fail_all_uploads = on;
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().sessions.get(id).cloned()
    }

    /// Accepted samples for a session, in arrival order.
    pub fn samples_for(&self, id: &SessionId) -> Vec<SampleDto> {
        self.state.lock().samples.get(id).cloned().unwrap_or_default()
    }

    /// Sizes of the accepted batches, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batches.clone()
    }

    pub fn upload_calls(&self) -> u64 {
        self.state.lock().upload_calls
    }

    pub fn bytes_received(&self) -> usize {
        self.state.lock().bytes_received
    }

    pub fn last_finish(&self) -> Option<FinishSessionRequest> {
        self.state.lock().last_finish.clone()
    }
}

impl Faults {
    fn upload_fault(&mut self, call: u64) -> Option<RemoteError> {
        if self.fail_all_uploads {
            return Some(RemoteError::Unreachable("uplink down".into()));
        }
        if self.uploads_to_fail > 0 {
            self.uploads_to_fail -= 1;
            return Some(RemoteError::Unreachable("injected upload failure".into()));
        }
        match self.fail_every {
            Some(n) if call % n == 0 => Some(RemoteError::Timeout),
            _ => None,
        }
    }
}

#[async_trait]
impl SessionService for InMemoryRemote {
    async fn create_session(&self, request: &NewSession) -> RemoteResult<Session> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.create.take() {
            return Err(err);
        }
        let mut session = Session::pending(request, Utc::now());
        let id = SessionId::new(Uuid::new_v4().simple().to_string());
        session.id = Some(id.clone());
        state.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn finish_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
        summary: Option<SessionSummary>,
    ) -> RemoteResult<Session> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.finish.take() {
            return Err(err);
        }
        state.last_finish = Some(FinishSessionRequest::new(ended_at, summary.clone()));
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        session.finish(ended_at, summary)?;
        Ok(session.clone())
    }

    async fn abort_session(&self, id: &SessionId) -> RemoteResult<Session> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.abort.take() {
            return Err(err);
        }
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        session.abort(Utc::now())?;
        Ok(session.clone())
    }
}

#[async_trait]
impl UploadClient for InMemoryRemote {
    async fn send(&self, session_id: &SessionId, samples: &[Sample]) -> RemoteResult<UploadAck> {
        if !self.upload_latency.is_zero() {
            tokio::time::sleep(self.upload_latency).await;
        }

        let request = CreateSamplesRequest::from_samples(samples);
        let body = serde_json::to_vec(&request).map_err(|e| RemoteError::Rejected {
            status: 400,
            message: e.to_string(),
        })?;

        let mut state = self.state.lock();
        state.upload_calls += 1;
        let call = state.upload_calls;
        if let Some(err) = state.faults.upload_fault(call) {
            debug!("[Remote] upload #{} failed: {}", call, err);
            return Err(err);
        }

        match state.sessions.get(session_id) {
            Some(session) if session.is_active() => {}
            Some(session) => {
                return Err(RemoteError::InvalidState(format!(
                    "session {} is {:?}",
                    session_id, session.status
                )))
            }
            None => return Err(RemoteError::NotFound(session_id.clone())),
        }

        let RemoteState { seen, samples: stored, .. } = &mut *state;
        let stored = stored.entry(session_id.clone()).or_default();
        for dto in request.samples {
            if seen.insert(dto.id) {
                stored.push(dto);
            }
        }
        state.batches.push(samples.len());
        state.bytes_received += body.len();

        Ok(UploadAck {
            received: samples.len(),
            session_id: session_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelKind, DeviceModel, SessionStatus, SessionType};

    fn request() -> NewSession {
        NewSession {
            user_id: "u-1".into(),
            session_type: SessionType::Training5Min,
            device: DeviceModel::Muse2,
            metadata: None,
        }
    }

    fn samples(id: &SessionId, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                Sample::new(id.clone(), Utc::now(), ChannelKind::PrimarySignal, vec![i as f64], None, None)
            })
            .collect()
    }

    #[tokio::test]
    async fn create_assigns_id_and_active_status() {
        let remote = InMemoryRemote::new();
        let session = remote.create_session(&request()).await.unwrap();
        let id = session.id.clone().expect("id assigned");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(remote.session(&id), Some(session));
    }

    #[tokio::test]
    async fn retried_batch_is_deduplicated_by_sample_id() {
        let remote = InMemoryRemote::new();
        let id = remote.create_session(&request()).await.unwrap().id.unwrap();
        let batch = samples(&id, 5);

        let ack = remote.send(&id, &batch).await.unwrap();
        assert_eq!(ack.received, 5);
        remote.send(&id, &batch).await.unwrap();

        assert_eq!(remote.samples_for(&id).len(), 5);
        assert_eq!(remote.batch_sizes(), vec![5, 5]);
        assert!(remote.bytes_received() > 0);
    }

    #[tokio::test]
    async fn scripted_upload_faults() {
        let remote = InMemoryRemote::new();
        let id = remote.create_session(&request()).await.unwrap().id.unwrap();
        let batch = samples(&id, 1);

        remote.fail_next_uploads(1);
        assert!(remote.send(&id, &batch).await.is_err());
        assert!(remote.send(&id, &batch).await.is_ok());

        remote.fail_every_nth_upload(3);
        assert_eq!(remote.send(&id, &batch).await, Err(RemoteError::Timeout));
        assert_eq!(remote.upload_calls(), 3);
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let remote = InMemoryRemote::new();
        let id = remote.create_session(&request()).await.unwrap().id.unwrap();

        let finished = remote.finish_session(&id, Utc::now(), None).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Finished);
        assert!(remote.last_finish().is_some());
        assert!(matches!(
            remote.abort_session(&id).await,
            Err(RemoteError::InvalidState(_))
        ));
        assert!(matches!(
            remote.send(&id, &samples(&id, 1)).await,
            Err(RemoteError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let remote = InMemoryRemote::new();
        let ghost = SessionId::new("ghost");
        assert_eq!(
            remote.abort_session(&ghost).await,
            Err(RemoteError::NotFound(ghost))
        );
    }
}
