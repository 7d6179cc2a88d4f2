//! End-to-end capture scenarios: simulated band → orchestrator → in-memory service.
//!
//! The band is never connected here, so no generated frames interfere; every
//! frame is injected through the streaming gate.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;

use biosignal_capture::{
    capture::{Phase, SessionOrchestrator, StopOutcome},
    config::CaptureConfig,
    device::{DeviceInfo, DeviceLink, Frame, SimulatedBand, SimulatedBandConfig},
    error::{CaptureError, RemoteError},
    model::{ChannelKind, SessionId, SessionStatus},
    remote::InMemoryRemote,
};

struct Rig {
    band: Arc<SimulatedBand>,
    device: DeviceInfo,
    remote: Arc<InMemoryRemote>,
    orchestrator: SessionOrchestrator,
}

fn rig(remote: InMemoryRemote) -> Rig {
    let (band, device) = SimulatedBand::single(SimulatedBandConfig {
        event_capacity: 4096,
        ..SimulatedBandConfig::default()
    });
    let band = Arc::new(band);
    let remote = Arc::new(remote);
    let config = CaptureConfig {
        batch_size: 50,
        event_capacity: 4096,
        session_duration: Duration::from_secs(60),
        ..CaptureConfig::default()
    };
    let orchestrator =
        SessionOrchestrator::new(config, band.clone(), remote.clone(), remote.clone());
    Rig { band, device, remote, orchestrator }
}

fn frame(i: u64) -> Frame {
    Frame {
        seq: i,
        timestamp: Utc::now(),
        kind: ChannelKind::PrimarySignal,
        values: vec![i as f64, 0.0, 0.0, 0.0],
        quality: Some(0.9),
        device_status: None,
    }
}

impl Rig {
    async fn start(&self) -> SessionId {
        let session = self.orchestrator.start(&self.device).await.expect("start");
        session.id.expect("service assigns an id")
    }

    fn inject(&self, range: std::ops::Range<u64>) {
        for i in range {
            assert!(self.band.inject_frame(frame(i)), "streaming gate closed");
        }
    }

    async fn wait_appended(&self, n: u64) {
        eventually("samples appended", || self.orchestrator.buffer_accounting().appended == n).await;
    }

    /// Ordered first-channel values the service accepted for the session.
    fn delivered_values(&self, id: &SessionId) -> Vec<f64> {
        self.remote.samples_for(id).iter().map(|s| s.channels[0]).collect()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn range_values(range: std::ops::Range<u64>) -> Vec<f64> {
    range.map(|i| i as f64).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threshold_uploads_then_stop_delivers_remainder() {
    let rig = rig(InMemoryRemote::new());
    let id = rig.start().await;
    assert_eq!(rig.orchestrator.phase(), Phase::Capturing);
    assert!(rig.band.is_streaming());

    rig.inject(0..120);
    rig.wait_appended(120).await;
    eventually("two threshold uploads", || rig.remote.batch_sizes() == vec![50, 50]).await;
    eventually("upload lane idle", || !rig.orchestrator.upload_in_flight()).await;
    assert_eq!(rig.orchestrator.buffered_len(), 20);

    let report = rig.orchestrator.stop(None).await.expect("stop");
    assert_eq!(report.outcome, StopOutcome::Delivered);
    assert_eq!(report.delivered, 20);
    assert_eq!(report.session.status, SessionStatus::Finished);
    assert_eq!(rig.remote.batch_sizes(), vec![50, 50, 20]);
    assert_eq!(rig.delivered_values(&id), range_values(0..120));

    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
    assert_eq!(rig.orchestrator.buffered_len(), 0);
    assert!(!rig.band.is_streaming());
    let acc = rig.orchestrator.buffer_accounting();
    assert!(acc.is_balanced());
    assert_eq!(acc.delivered, 120);
}

#[tokio::test]
async fn second_start_is_rejected_while_capturing() {
    let rig = rig(InMemoryRemote::new());
    let id = rig.start().await;

    let err = rig.orchestrator.start(&rig.device).await.unwrap_err();
    assert!(matches!(err, CaptureError::AlreadyActive));
    assert_eq!(rig.orchestrator.phase(), Phase::Capturing);
    assert_eq!(rig.orchestrator.session().and_then(|s| s.id), Some(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_upload_discards_everything() {
    let rig = rig(InMemoryRemote::new().with_upload_latency(Duration::from_millis(300)));
    let id = rig.start().await;

    rig.inject(0..70);
    rig.wait_appended(70).await;
    eventually("upload in flight", || rig.orchestrator.upload_in_flight()).await;

    let aborted = rig.orchestrator.abort().await.expect("abort");
    assert_eq!(aborted.status, SessionStatus::Aborted);
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
    assert_eq!(rig.orchestrator.buffered_len(), 0);

    // the outstanding upload resolves against an aborted session
    eventually("upload settles", || !rig.orchestrator.upload_in_flight()).await;
    assert_eq!(rig.orchestrator.buffered_len(), 0);
    assert!(rig.remote.samples_for(&id).is_empty());
    let acc = rig.orchestrator.buffer_accounting();
    assert_eq!(acc.in_flight, 0);
    assert_eq!(acc.discarded, 70);
    assert!(acc.is_balanced());

    // frames after abort go nowhere
    assert!(!rig.band.inject_frame(frame(999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_with_dead_uplink_reports_partial_and_keeps_samples() {
    let remote = InMemoryRemote::new();
    remote.fail_all_uploads(true);
    let rig = rig(remote);
    let id = rig.start().await;

    rig.inject(0..60);
    rig.wait_appended(60).await;
    eventually("upload lane idle", || !rig.orchestrator.upload_in_flight()).await;

    let report = rig.orchestrator.stop(None).await.expect("finish still succeeds");
    match &report.outcome {
        StopOutcome::Partial { undelivered, last_error } => {
            assert_eq!(*undelivered, 60);
            assert_eq!(*last_error, RemoteError::Unreachable("uplink down".into()));
        }
        other => panic!("expected partial outcome, got {:?}", other),
    }
    assert!(!report.is_complete());
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
    assert_eq!(rig.orchestrator.buffered_len(), 60);
    assert_eq!(rig.remote.session(&id).map(|s| s.status), Some(SessionStatus::Finished));

    let kept = rig.orchestrator.take_undelivered().expect("idle");
    let values: Vec<f64> = kept.iter().map(|s| s.channels()[0]).collect();
    assert_eq!(values, range_values(0..60));
    assert!(kept.iter().all(|s| s.session_id() == &id));
    assert_eq!(rig.orchestrator.buffered_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_batch_goes_out_first_on_next_trigger() {
    let remote = InMemoryRemote::new();
    remote.fail_next_uploads(1);
    let rig = rig(remote);
    let id = rig.start().await;

    rig.inject(0..50);
    rig.wait_appended(50).await;
    eventually("first attempt", || rig.remote.upload_calls() == 1).await;
    eventually("upload lane idle", || !rig.orchestrator.upload_in_flight()).await;
    assert_eq!(rig.orchestrator.buffered_len(), 50, "failed batch is requeued");
    assert!(rig.remote.batch_sizes().is_empty());

    rig.inject(50..100);
    rig.wait_appended(100).await;
    eventually("retry accepted", || !rig.remote.batch_sizes().is_empty()).await;

    let accepted = rig.delivered_values(&id);
    assert_eq!(accepted[..50], range_values(0..50)[..]);

    rig.orchestrator.stop(None).await.expect("stop");
    assert_eq!(rig.delivered_values(&id), range_values(0..100));
    let metrics = rig.orchestrator.metrics();
    let m = metrics.lock().unwrap();
    assert_eq!(m.batches_failed, 1);
    assert_eq!(m.samples_requeued, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threshold_crossed_during_failed_upload_is_retried() {
    let remote = InMemoryRemote::new().with_upload_latency(Duration::from_millis(200));
    remote.fail_next_uploads(1);
    let rig = rig(remote);
    let id = rig.start().await;

    rig.inject(0..50);
    rig.wait_appended(50).await;
    eventually("upload in flight", || rig.orchestrator.upload_in_flight()).await;
    // these cross the threshold while the lane is busy with the doomed attempt
    rig.inject(50..60);
    rig.wait_appended(60).await;

    // no further frames: the pending trigger alone drives the retry
    eventually("retry accepted", || rig.remote.batch_sizes() == vec![50]).await;
    eventually("upload lane idle", || !rig.orchestrator.upload_in_flight()).await;
    assert_eq!(rig.delivered_values(&id), range_values(0..50));
    assert_eq!(rig.remote.upload_calls(), 2);
    assert_eq!(rig.orchestrator.buffered_len(), 10);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.remote.upload_calls(), 2, "no retries without a trigger");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_outliving_abort_serves_the_next_session() {
    let rig = rig(InMemoryRemote::new().with_upload_latency(Duration::from_millis(200)));
    let first = rig.start().await;

    rig.inject(0..50);
    rig.wait_appended(50).await;
    eventually("upload in flight", || rig.orchestrator.upload_in_flight()).await;
    rig.orchestrator.abort().await.expect("abort");

    let second = rig.start().await;
    rig.inject(100..150);
    rig.wait_appended(100).await;

    eventually("new session batch delivered", || {
        rig.delivered_values(&second) == range_values(100..150)
    })
    .await;
    eventually("upload lane idle", || !rig.orchestrator.upload_in_flight()).await;
    assert!(rig.remote.samples_for(&first).is_empty());
    assert_eq!(rig.orchestrator.buffered_len(), 0);

    let report = rig.orchestrator.stop(None).await.expect("stop");
    assert_eq!(report.outcome, StopOutcome::Delivered);
    assert_eq!(report.delivered, 0);
    let acc = rig.orchestrator.buffer_accounting();
    assert!(acc.is_balanced());
    assert_eq!(acc.in_flight, 0);
    assert_eq!(acc.discarded, 50);
    assert_eq!(acc.delivered, 50);
}

#[tokio::test]
async fn create_failure_leaves_pipeline_idle() {
    let remote = InMemoryRemote::new();
    remote.fail_next_create(RemoteError::Rejected { status: 401, message: "expired token".into() });
    let rig = rig(remote);

    let err = rig.orchestrator.start(&rig.device).await.unwrap_err();
    assert!(matches!(err, CaptureError::CreateFailed(RemoteError::Rejected { status: 401, .. })));
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
    assert!(!rig.band.is_streaming());
    assert!(rig.orchestrator.session().is_none());

    rig.start().await;
    assert_eq!(rig.orchestrator.phase(), Phase::Capturing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finish_failure_still_returns_to_idle() {
    let remote = InMemoryRemote::new();
    remote.fail_next_finish(RemoteError::Timeout);
    let rig = rig(remote);
    let id = rig.start().await;

    rig.inject(0..10);
    rig.wait_appended(10).await;

    match rig.orchestrator.stop(None).await {
        Err(CaptureError::FinishFailed { source, undelivered }) => {
            assert_eq!(source, RemoteError::Timeout);
            assert_eq!(undelivered, 0);
        }
        other => panic!("expected finish failure, got {:?}", other.map(|r| r.outcome)),
    }
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
    assert_eq!(rig.delivered_values(&id).len(), 10);
    assert!(rig.orchestrator.session().is_none());
}

#[tokio::test]
async fn abort_failure_still_returns_to_idle() {
    let remote = InMemoryRemote::new();
    remote.fail_next_abort(RemoteError::Unreachable("offline".into()));
    let rig = rig(remote);
    rig.start().await;

    let err = rig.orchestrator.abort().await.unwrap_err();
    assert!(matches!(err, CaptureError::AbortFailed(RemoteError::Unreachable(_))));
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
}

#[tokio::test]
async fn stop_and_abort_need_an_active_session() {
    let rig = rig(InMemoryRemote::new());
    assert!(matches!(rig.orchestrator.stop(None).await, Err(CaptureError::NoActiveSession)));
    assert!(matches!(rig.orchestrator.abort().await, Err(CaptureError::NoActiveSession)));
    assert!(rig.orchestrator.take_undelivered().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_transition_fails_fast() {
    let rig = rig(InMemoryRemote::new().with_upload_latency(Duration::from_millis(200)));
    rig.start().await;
    rig.inject(0..10);
    rig.wait_appended(10).await;

    let (stopped, aborted) = tokio::join!(rig.orchestrator.stop(None), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.orchestrator.abort().await
    });

    assert!(matches!(aborted, Err(CaptureError::TransitionInProgress(Phase::Stopping))));
    assert!(stopped.expect("stop wins").is_complete());
    assert_eq!(rig.orchestrator.phase(), Phase::Idle);
}

#[tokio::test]
async fn leftovers_are_discarded_by_next_start() {
    let remote = InMemoryRemote::new();
    remote.fail_all_uploads(true);
    let rig = rig(remote);
    rig.start().await;
    rig.inject(0..5);
    rig.wait_appended(5).await;
    let report = rig.orchestrator.stop(None).await.unwrap();
    assert_eq!(report.undelivered(), 5);

    rig.remote.fail_all_uploads(false);
    rig.start().await;
    assert_eq!(rig.orchestrator.buffered_len(), 0);
    assert_eq!(rig.orchestrator.metrics().lock().unwrap().samples_discarded, 5);
}

#[tokio::test]
async fn progress_reflects_live_capture() {
    let rig = rig(InMemoryRemote::new());
    let idle = rig.orchestrator.progress();
    assert_eq!(idle.phase, Phase::Idle);
    assert_eq!(idle.fraction, 0.0);
    assert_eq!(rig.orchestrator.formatted_time_remaining(), "1:00");

    let id = rig.start().await;
    rig.inject(0..3);
    let mut motion = frame(3);
    motion.kind = ChannelKind::Motion;
    motion.values = vec![0.1, 0.2, 0.3];
    assert!(rig.band.inject_frame(motion));
    rig.wait_appended(4).await;

    let progress = rig.orchestrator.progress();
    assert_eq!(progress.phase, Phase::Capturing);
    assert_eq!(progress.session_id, Some(id));
    assert_eq!(progress.buffered, 4);
    assert_eq!(progress.primary_frames, 3);
    assert_eq!(progress.signal_strength, 5);
    assert!(progress.fraction < 0.1);
    assert!(!rig.orchestrator.is_time_up());

    let counts = rig.orchestrator.frame_counts();
    assert!(counts.contains(&(ChannelKind::PrimarySignal, 3)));
    assert!(counts.contains(&(ChannelKind::Motion, 1)));

    let summary = rig.orchestrator.live_summary();
    assert_eq!(summary.total_samples, Some(3));
    assert_eq!(summary.good_sample_rate, Some(1.0));

    let report = rig.orchestrator.stop(Some(summary.clone())).await.unwrap();
    assert_eq!(report.session.summary, Some(summary));
    assert_eq!(rig.remote.last_finish().and_then(|f| f.summary).and_then(|s| s.total_samples), Some(3));
}
