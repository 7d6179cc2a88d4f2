//! orchestrator.rs
//! Capture pipeline: one session at a time, from remote create to finish/abort.
//!
//! Phases: Idle → Starting → Capturing → Stopping → Idle, plus
//! Capturing → Aborting → Idle. Every transition settles back in Idle, also
//! when the remote call fails; the error travels with the result.
//!
//! Two tokio tasks run while capturing:
//! - ingest: reads device events, tags frames as samples, appends them
//! - upload: spawned when the buffer reaches the batch size; drains batches
//!   for the capturing session and sends them one at a time through the
//!   single upload lane
//!
//! Frame ingestion never awaits anything but the next device event.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard},
    task::JoinHandle,
};

use crate::capture::buffer::{Batch, BufferAccounting, SampleBuffer};
use crate::config::CaptureConfig;
use crate::device::{DeviceInfo, DeviceLink, LinkEvent, LinkEvents};
use crate::error::{CaptureError, CaptureResult, RemoteError};
use crate::model::{
    ChannelKind, NewSession, Sample, Session, SessionId, SessionMetadata, SessionSummary,
};
use crate::remote::{SessionService, UploadClient};
use crate::utils::metrics::{lock_metrics, CaptureMetrics, FrameCounters, SharedMetrics};
use crate::utils::trace::{CaptureEvent, CaptureTrace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Capturing,
    Stopping,
    Aborting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Capturing => "capturing",
            Phase::Stopping => "stopping",
            Phase::Aborting => "aborting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the final drain at stop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Every captured sample reached the service.
    Delivered,
    /// Samples remain in the buffer; see `SessionOrchestrator::take_undelivered`.
    Partial {
        undelivered: usize,
        last_error: RemoteError,
    },
}

#[derive(Debug, Clone)]
pub struct StopReport {
    /// The session as the service returned it from finish.
    pub session: Session,
    /// Samples delivered by the final drain.
    pub delivered: usize,
    pub outcome: StopOutcome,
}

impl StopReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == StopOutcome::Delivered
    }

    pub fn undelivered(&self) -> usize {
        match self.outcome {
            StopOutcome::Delivered => 0,
            StopOutcome::Partial { undelivered, .. } => undelivered,
        }
    }
}

/// Read-only snapshot for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureProgress {
    pub phase: Phase,
    pub session_id: Option<SessionId>,
    pub elapsed: Duration,
    pub remaining: Duration,
    /// Share of the planned duration already elapsed, in [0,1].
    pub fraction: f64,
    pub buffered: usize,
    pub delivered: u64,
    pub failed_uploads: u64,
    pub upload_in_flight: bool,
    pub primary_frames: u64,
    pub avg_quality: f64,
    pub signal_strength: u8,
}

#[derive(Default)]
struct PipelineState {
    phase: Phase,
    session: Option<Session>,
    started: Option<Instant>,
}

struct IngestTask {
    handle: JoinHandle<()>,
    finish: oneshot::Sender<()>,
}

/// State reachable from the background tasks.
struct Shared {
    state: Mutex<PipelineState>,
    buffer: SampleBuffer,
    uploader: Arc<dyn UploadClient>,
    upload_lane: Arc<AsyncMutex<()>>,
    /// Set by every threshold crossing, cleared when an upload round begins.
    upload_pending: AtomicBool,
    batch_size: usize,
    metrics: SharedMetrics,
    counters: FrameCounters,
    trace: Arc<CaptureTrace>,
}

impl Shared {
    fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    fn ingest_frame(self: &Arc<Self>, session_id: &SessionId, epoch: u64, event: LinkEvent) {
        let frame = match event {
            LinkEvent::Frame(frame) => frame,
            LinkEvent::ConnectionChanged(state) => {
                if !state.is_connected() {
                    warn!("[Capture] device link {} during session {}", state, session_id);
                }
                return;
            }
            LinkEvent::DeviceDiscovered(_) => return,
        };

        let sample = Sample::from_frame(session_id.clone(), &frame);
        let Some(len) = self.buffer.append_in(epoch, sample) else {
            return;
        };
        self.counters.record(frame.kind);
        lock_metrics(&self.metrics).record_frame(&frame);
        if frame.kind == ChannelKind::PrimarySignal {
            self.trace.record(CaptureEvent::FrameIngested { buffered: len });
        }

        if len >= self.batch_size && self.phase() == Phase::Capturing {
            self.trigger_upload();
        }
    }

    /// Starts a background upload unless one is already running. A trigger
    /// that finds the lane busy is left pending for the running task.
    fn trigger_upload(self: &Arc<Self>) {
        self.upload_pending.store(true, Ordering::SeqCst);
        let Ok(lane) = self.upload_lane.clone().try_lock_owned() else {
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move { shared.upload_rounds(lane).await });
    }

    async fn upload_rounds(self: Arc<Self>, lane: OwnedMutexGuard<()>) {
        let mut lane = lane;
        loop {
            self.upload_pending.store(false, Ordering::SeqCst);
            if !self.upload_while_full().await {
                debug!("[Upload] attempt failed, waiting for the next trigger");
            }
            drop(lane);
            // a failed batch is retried only for a trigger that arrived meanwhile
            if !self.upload_pending.load(Ordering::SeqCst) || self.upload_target().is_none() {
                break;
            }
            match self.upload_lane.clone().try_lock_owned() {
                Ok(next) => lane = next,
                Err(_) => break,
            }
        }
    }

    /// Session and buffer epoch to upload for: the capturing session, once its
    /// buffer holds a full batch.
    fn upload_target(&self) -> Option<(SessionId, u64)> {
        let st = self.state.lock();
        if st.phase != Phase::Capturing || self.buffer.len() < self.batch_size {
            return None;
        }
        let session_id = st.session.as_ref()?.id.clone()?;
        Some((session_id, self.buffer.epoch()))
    }

    /// Uploads full batches for whichever session is capturing. Returns `false`
    /// when an attempt failed; the batch is back at the buffer head.
    async fn upload_while_full(&self) -> bool {
        while let Some((session_id, epoch)) = self.upload_target() {
            // the session closed between reading the target and draining
            let Some(batch) = self.buffer.drain_from(epoch, self.batch_size) else {
                continue;
            };
            if self.deliver(&session_id, batch).await.is_err() {
                return false;
            }
        }
        true
    }

    /// One upload attempt. The batch ends either delivered or back at the buffer head.
    async fn deliver(&self, session_id: &SessionId, batch: Batch) -> Result<usize, RemoteError> {
        let size = batch.len();
        let epoch = batch.epoch();
        self.trace.record(CaptureEvent::BatchDrained { size });

        let started = Instant::now();
        let result = self.uploader.send(session_id, batch.samples()).await;
        let latency_us = started.elapsed().as_micros() as u64;
        let current = self.buffer.epoch() == epoch;

        match result {
            Ok(ack) => {
                if ack.received != size {
                    debug!("[Upload] service acknowledged {} of {} samples", ack.received, size);
                }
                self.buffer.complete(batch);
                if current {
                    lock_metrics(&self.metrics).record_upload_ok(size, latency_us);
                }
                self.trace.record(CaptureEvent::UploadSucceeded { size, latency_us });
                debug!("[Upload] delivered {} samples in {} us", size, latency_us);
                Ok(size)
            }
            Err(e) => {
                let requeued = self.buffer.requeue(batch);
                if current {
                    lock_metrics(&self.metrics).record_upload_failed(size, &e.to_string(), requeued);
                }
                self.trace.record(CaptureEvent::UploadFailed { size, reason: e.to_string() });
                if requeued {
                    warn!("[Upload] batch of {} failed ({}), requeued", size, e);
                    self.trace.record(CaptureEvent::BatchRequeued { size });
                } else {
                    info!("[Upload] batch of {} failed after session was discarded ({})", size, e);
                    self.trace.record(CaptureEvent::BatchRejected { size });
                }
                Err(e)
            }
        }
    }
}

async fn run_ingest(
    shared: Arc<Shared>,
    mut events: LinkEvents,
    mut finish: oneshot::Receiver<()>,
    session_id: SessionId,
    epoch: u64,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => shared.ingest_frame(&session_id, epoch, event),
                None => break,
            },
            _ = &mut finish => {
                // streaming is already off; take what the link forwarded before that
                while let Ok(event) = events.try_recv() {
                    shared.ingest_frame(&session_id, epoch, event);
                }
                break;
            }
        }
    }
    debug!("[Capture] ingest for {} exited", session_id);
}

pub struct SessionOrchestrator {
    link: Arc<dyn DeviceLink>,
    sessions: Arc<dyn SessionService>,
    shared: Arc<Shared>,
    config: CaptureConfig,
    ingest: Mutex<Option<IngestTask>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: CaptureConfig,
        link: Arc<dyn DeviceLink>,
        sessions: Arc<dyn SessionService>,
        uploader: Arc<dyn UploadClient>,
    ) -> Self {
        let shared = Shared {
            state: Mutex::new(PipelineState::default()),
            buffer: SampleBuffer::new(config.buffer_warn_len),
            uploader,
            upload_lane: Arc::new(AsyncMutex::new(())),
            upload_pending: AtomicBool::new(false),
            batch_size: config.batch_size.max(1),
            metrics: CaptureMetrics::shared(config.chart_points),
            counters: FrameCounters::new(),
            trace: Arc::new(CaptureTrace::default()),
        };
        Self {
            link,
            sessions,
            shared: Arc::new(shared),
            config,
            ingest: Mutex::new(None),
        }
    }

    /// Creates the remote session and starts streaming from `device`.
    pub async fn start(&self, device: &DeviceInfo) -> CaptureResult<Session> {
        self.begin_start()?;

        if !self.link.connection_state().is_connected() {
            warn!("[Capture] starting while device link is {}", self.link.connection_state());
        }

        let request = NewSession {
            user_id: self.config.user_id.clone(),
            session_type: self.config.session_type,
            device: device.model,
            metadata: Some(SessionMetadata::for_host(
                &self.config.app_version,
                self.config.sdk_version.as_deref(),
            )),
        };
        let session = match self.sessions.create_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                error!("[Capture] create session failed: {}", e);
                self.settle_idle();
                return Err(CaptureError::CreateFailed(e));
            }
        };
        let Some(session_id) = session.id.clone() else {
            self.settle_idle();
            return Err(CaptureError::CreateFailed(RemoteError::InvalidState(
                "created session has no identifier".into(),
            )));
        };

        // each session gets a fresh buffer epoch
        let leftover = self.shared.buffer.clear();
        let epoch = self.shared.buffer.epoch();
        lock_metrics(&self.shared.metrics).reset();
        self.shared.counters.reset();
        if leftover > 0 {
            warn!("[Capture] discarding {} undelivered samples from the previous session", leftover);
            lock_metrics(&self.shared.metrics).record_discarded(leftover);
            self.shared.trace.record(CaptureEvent::BufferDiscarded { count: leftover });
        }

        {
            let mut st = self.shared.state.lock();
            st.session = Some(session.clone());
            st.started = Some(Instant::now());
        }

        let events = self.link.subscribe();
        let (finish, finish_rx) = oneshot::channel();
        let handle = tokio::spawn(run_ingest(
            self.shared.clone(),
            events,
            finish_rx,
            session_id.clone(),
            epoch,
        ));
        *self.ingest.lock() = Some(IngestTask { handle, finish });
        self.link.start_streaming();

        self.set_phase(Phase::Capturing);
        info!("[Capture] session {} capturing from {}", session_id, device.name);
        Ok(session)
    }

    /// Stops streaming, delivers what is buffered, then finishes the remote session.
    ///
    /// The final drain sends batch-size chunks and stops at the first failure,
    /// leaving the rest buffered and reported as `StopOutcome::Partial`.
    pub async fn stop(&self, summary: Option<SessionSummary>) -> CaptureResult<StopReport> {
        let session_id = self.begin_close(Phase::Stopping)?;

        self.link.stop_streaming();
        let task = self.ingest.lock().take();
        if let Some(task) = task {
            let _ = task.finish.send(());
            if let Err(e) = task.handle.await {
                warn!("[Capture] ingest task ended abnormally: {}", e);
            }
        }

        let (delivered, last_error) = self.final_drain(&session_id).await;
        let undelivered = self.shared.buffer.len();

        let result = self
            .sessions
            .finish_session(&session_id, Utc::now(), summary)
            .await;
        self.settle_idle();

        let session = result.map_err(|source| {
            error!("[Capture] finish session {} failed: {}", session_id, source);
            CaptureError::FinishFailed { source, undelivered }
        })?;

        let outcome = match last_error {
            Some(last_error) if undelivered > 0 => {
                warn!("[Capture] session {} finished with {} undelivered samples", session_id, undelivered);
                StopOutcome::Partial { undelivered, last_error }
            }
            _ => StopOutcome::Delivered,
        };
        info!("[Capture] session {} finished, final drain delivered {}", session_id, delivered);
        Ok(StopReport { session, delivered, outcome })
    }

    /// Stops streaming and discards everything buffered for the session.
    ///
    /// Safe while an upload is outstanding: its result can no longer put
    /// samples back into the buffer.
    pub async fn abort(&self) -> CaptureResult<Session> {
        let session_id = self.begin_close(Phase::Aborting)?;

        self.link.stop_streaming();
        if let Some(task) = self.ingest.lock().take() {
            task.handle.abort();
        }
        let discarded = self.shared.buffer.clear();
        if discarded > 0 {
            lock_metrics(&self.shared.metrics).record_discarded(discarded);
            self.shared.trace.record(CaptureEvent::BufferDiscarded { count: discarded });
        }
        info!("[Capture] aborting session {}, discarded {} samples", session_id, discarded);

        let result = self.sessions.abort_session(&session_id).await;
        self.settle_idle();
        result.map_err(|e| {
            error!("[Capture] abort session {} failed: {}", session_id, e);
            CaptureError::AbortFailed(e)
        })
    }

    /// Hands over samples a partial stop left behind. Only valid while idle.
    pub fn take_undelivered(&self) -> CaptureResult<Vec<Sample>> {
        match self.phase() {
            Phase::Idle => Ok(self.shared.buffer.take_all()),
            Phase::Capturing => Err(CaptureError::AlreadyActive),
            other => Err(CaptureError::TransitionInProgress(other)),
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.state.lock().session.clone()
    }

    /// Device events for the presentation layer (connection changes, live frames).
    pub fn subscribe(&self) -> LinkEvents {
        self.link.subscribe()
    }

    pub fn elapsed(&self) -> Duration {
        self.shared
            .state
            .lock()
            .started
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn time_remaining(&self) -> Duration {
        self.config.session_duration.saturating_sub(self.elapsed())
    }

    /// Share of the planned session duration elapsed, in [0,1].
    pub fn progress_fraction(&self) -> f64 {
        let total = self.config.session_duration.as_secs_f64();
        if total <= 0.0 {
            return 1.0;
        }
        (self.elapsed().as_secs_f64() / total).clamp(0.0, 1.0)
    }

    pub fn formatted_time_remaining(&self) -> String {
        format_clock(self.time_remaining())
    }

    pub fn is_time_up(&self) -> bool {
        self.phase() == Phase::Capturing && self.time_remaining().is_zero()
    }

    pub fn progress(&self) -> CaptureProgress {
        let (phase, session_id) = {
            let st = self.shared.state.lock();
            (st.phase, st.session.as_ref().and_then(|s| s.id.clone()))
        };
        let elapsed = self.elapsed();
        let remaining = self.time_remaining();
        let fraction = self.progress_fraction();
        let buffered = self.shared.buffer.len();
        let upload_in_flight = self.upload_in_flight();

        let metrics = lock_metrics(&self.shared.metrics);
        CaptureProgress {
            phase,
            session_id,
            elapsed,
            remaining,
            fraction,
            buffered,
            delivered: metrics.samples_delivered,
            failed_uploads: metrics.batches_failed,
            upload_in_flight,
            primary_frames: metrics.primary_frames,
            avg_quality: metrics.avg_quality,
            signal_strength: metrics.signal_strength,
        }
    }

    /// Summary built from the live metrics, for `stop`.
    pub fn live_summary(&self) -> SessionSummary {
        lock_metrics(&self.shared.metrics).summary()
    }

    pub fn upload_in_flight(&self) -> bool {
        self.shared.upload_lane.try_lock().is_err()
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn buffer_accounting(&self) -> BufferAccounting {
        self.shared.buffer.accounting()
    }

    pub fn frame_counts(&self) -> Vec<(ChannelKind, u64)> {
        self.shared.counters.snapshot()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.shared.metrics.clone()
    }

    pub fn trace(&self) -> Arc<CaptureTrace> {
        self.shared.trace.clone()
    }

    /// Waits for any background upload, then drains the buffer in batch-size chunks.
    async fn final_drain(&self, session_id: &SessionId) -> (usize, Option<RemoteError>) {
        let _lane = self.shared.upload_lane.lock().await;
        let epoch = self.shared.buffer.epoch();
        let mut delivered = 0;

        loop {
            let Some(batch) = self.shared.buffer.drain_from(epoch, self.shared.batch_size) else {
                break;
            };
            if batch.is_empty() {
                self.shared.buffer.complete(batch);
                break;
            }
            match self.shared.deliver(session_id, batch).await {
                Ok(n) => delivered += n,
                Err(e) => return (delivered, Some(e)),
            }
        }
        (delivered, None)
    }

    /// Only one transition may be pending; concurrent calls fail fast.
    fn begin_start(&self) -> CaptureResult<()> {
        let mut st = self.shared.state.lock();
        match st.phase {
            Phase::Idle => {}
            Phase::Capturing => return Err(CaptureError::AlreadyActive),
            other => return Err(CaptureError::TransitionInProgress(other)),
        }
        self.transition(&mut st, Phase::Starting);
        Ok(())
    }

    /// Moves Capturing to `next` (Stopping or Aborting) and returns the active session id.
    fn begin_close(&self, next: Phase) -> CaptureResult<SessionId> {
        let mut st = self.shared.state.lock();
        match st.phase {
            Phase::Capturing => {}
            Phase::Idle => return Err(CaptureError::NoActiveSession),
            other => return Err(CaptureError::TransitionInProgress(other)),
        }
        let session_id = st
            .session
            .as_ref()
            .and_then(|s| s.id.clone())
            .ok_or(CaptureError::NoActiveSession)?;
        self.transition(&mut st, next);
        Ok(session_id)
    }

    fn set_phase(&self, next: Phase) {
        let mut st = self.shared.state.lock();
        self.transition(&mut st, next);
    }

    fn settle_idle(&self) {
        let mut st = self.shared.state.lock();
        self.transition(&mut st, Phase::Idle);
        st.session = None;
        st.started = None;
    }

    fn transition(&self, st: &mut PipelineState, next: Phase) {
        self.shared.trace.record(CaptureEvent::Transition {
            from: st.phase.as_str(),
            to: next.as_str(),
        });
        debug!("[Capture] {} -> {}", st.phase, next);
        st.phase = next;
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.ingest.get_mut().take() {
            task.handle.abort();
        }
    }
}

/// "m:ss" countdown text.
pub fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}
