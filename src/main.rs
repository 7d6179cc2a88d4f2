//! # Capture Demo Entry Point
//!
//! Runs one capture session against a simulated band and an in-memory
//! session service, printing the live countdown and the stop outcome.
//!
//! ## Scenarios
//! - **Healthy uplink:** every upload succeeds; stop delivers the remainder.
//! - **Flaky uplink:** every third upload times out; failed batches are requeued
//!   and go out with the next trigger.
//! - **Abort:** the session is aborted halfway; buffered samples are discarded.
//!
//! ## Environment
//! - `RUST_LOG` for log verbosity, `CAPTURE_*` for pipeline settings.
//! - `CAPTURE_TRACE_CSV=data/logs/capture_trace.csv` writes the capture trace.

use std::{
    fs::create_dir_all,
    io::{stdin, stdout, Write},
    sync::Arc,
    time::Duration,
};

use log::{error, info, warn};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

use biosignal_capture::{
    config::CaptureConfig,
    device::{ConnectionState, DeviceInfo, DeviceLink, LinkEvent, LinkEvents, SimulatedBand, SimulatedBandConfig},
    error::CaptureError,
    remote::InMemoryRemote,
    utils::metrics::{calculate_stats_u64, lock_metrics},
    SessionOrchestrator, StopOutcome,
};

const DEFAULT_DEMO_SECS: u64 = 20;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEMO_UPLOAD_LATENCY: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Healthy,
    FlakyUplink,
    AbortHalfway,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    env_logger::init();
    info!("=== CAPTURE DEMO START ===");

    let mut config = match CaptureConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };

    loop {
        let scenario = match prompt_menu().as_str() {
            "1" | "" => Scenario::Healthy,
            "2" => Scenario::FlakyUplink,
            "3" => Scenario::AbortHalfway,
            "4" => {
                println!("Exiting. Goodbye!");
                info!("=== CAPTURE DEMO FINISHED ===");
                return;
            }
            other => {
                println!("Unrecognized option '{}', please try again.", other);
                continue;
            }
        };

        config.session_duration = Duration::from_secs(prompt_session_secs());
        if let Err(e) = run_session(&config, scenario).await {
            println!("\n Session failed: {}", e);
        }
        println!("\n Returning to menu...\n");
    }
}

fn prompt_menu() -> String {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     SELECT CAPTURE SCENARIO                 │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) Healthy uplink                          │");
    println!("│  2) Flaky uplink (every 3rd upload fails)   │");
    println!("│  3) Abort halfway                           │");
    println!("│  4) Exit                                    │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select [1/2/3/4] (default: 1): ");
    let _ = stdout().flush();

    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input.trim().to_string()
}

fn prompt_session_secs() -> u64 {
    print!("Session length in seconds [default: {}]: ", DEFAULT_DEMO_SECS);
    let _ = stdout().flush();
    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_DEMO_SECS)
}

async fn run_session(config: &CaptureConfig, scenario: Scenario) -> Result<(), CaptureError> {
    let (band, _) = SimulatedBand::single(SimulatedBandConfig {
        event_capacity: config.event_capacity,
        ..SimulatedBandConfig::default()
    });
    let band = Arc::new(band);

    let Some(device) = discover_and_connect(band.as_ref()).await else {
        println!(" No band available, try again.");
        return Ok(());
    };

    let remote = Arc::new(InMemoryRemote::new().with_upload_latency(DEMO_UPLOAD_LATENCY));
    if scenario == Scenario::FlakyUplink {
        remote.fail_every_nth_upload(3);
    }

    let orchestrator = SessionOrchestrator::new(config.clone(), band.clone(), remote.clone(), remote.clone());
    let trace = orchestrator.trace();
    if let Some(path) = &config.trace_csv {
        if let Some(dir) = path.parent() {
            create_dir_all(dir).ok();
        }
        if let Err(e) = trace.start_exporter(path) {
            warn!("capture trace disabled: {}", e);
        }
    }

    let session = orchestrator.start(&device).await?;
    println!(
        "\n Session {} started ({:?}, {:?})",
        session.id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
        session.session_type,
        session.device
    );

    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let progress = orchestrator.progress();
        println!(
            " {} left | {:>3.0}% | signal {}/5 | quality {:.2} | buffered {:>4} | delivered {:>5} | failed uploads {}",
            orchestrator.formatted_time_remaining(),
            progress.fraction * 100.0,
            progress.signal_strength,
            progress.avg_quality,
            progress.buffered,
            progress.delivered,
            progress.failed_uploads,
        );

        if scenario == Scenario::AbortHalfway && progress.fraction >= 0.5 {
            let aborted = orchestrator.abort().await?;
            println!("\n Session aborted, status {:?}", aborted.status);
            break;
        }
        if orchestrator.is_time_up() {
            let report = orchestrator.stop(Some(orchestrator.live_summary())).await?;
            println!(
                "\n Session finished in {} ({} delivered by the final drain)",
                report.session.formatted_duration(),
                report.delivered
            );
            if let StopOutcome::Partial { undelivered, last_error } = &report.outcome {
                println!(" {} samples undelivered: {}", undelivered, last_error);
                let kept = orchestrator.take_undelivered()?;
                println!(" Handed {} samples back to the caller", kept.len());
            }
            break;
        }
    }

    band.disconnect();
    trace.stop_exporter();
    print_totals(&orchestrator, &remote);
    Ok(())
}

/// Scans for the band and connects to the first device found.
async fn discover_and_connect(band: &SimulatedBand) -> Option<DeviceInfo> {
    let mut events = band.subscribe();

    band.start_scan();
    let device = wait_for(&mut events, DISCOVERY_TIMEOUT, |event| match event {
        LinkEvent::DeviceDiscovered(device) => Some(device),
        _ => None,
    })
    .await;
    band.stop_scan();
    let device = device?;
    println!(" Found {} ({})", device.name, device.id);

    band.connect(&device);
    let connected = wait_for(&mut events, CONNECT_TIMEOUT, |event| match event {
        LinkEvent::ConnectionChanged(ConnectionState::Connected) => Some(Ok(())),
        LinkEvent::ConnectionChanged(ConnectionState::Error(reason)) => Some(Err(reason)),
        _ => None,
    })
    .await;

    match connected {
        Some(Ok(())) => {
            println!(" Connected to {}", device.name);
            Some(device)
        }
        Some(Err(reason)) => {
            println!(" Connection failed: {}", reason);
            None
        }
        None => {
            println!(" Connection timed out");
            band.disconnect();
            None
        }
    }
}

async fn wait_for<T, F>(events: &mut LinkEvents, within: Duration, mut pick: F) -> Option<T>
where
    F: FnMut(LinkEvent) -> Option<T>,
{
    let deadline = Instant::now() + within;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                if let Some(found) = pick(event) {
                    return Some(found);
                }
            }
            _ => return None,
        }
    }
}

fn print_totals(orchestrator: &SessionOrchestrator, remote: &InMemoryRemote) {
    let accounting = orchestrator.buffer_accounting();
    println!("\n┌─ Totals ───────────────────────────────────");
    for (kind, count) in orchestrator.frame_counts() {
        println!("│ {:<5} frames: {}", kind.tag(), count);
    }
    println!(
        "│ samples: appended {} | delivered {} | discarded {} | buffered {}",
        accounting.appended, accounting.delivered, accounting.discarded, accounting.buffered
    );
    println!(
        "│ uploads: {} calls | accepted batches {} | {} bytes",
        remote.upload_calls(),
        remote.batch_sizes().len(),
        remote.bytes_received()
    );

    let metrics = orchestrator.metrics();
    let m = lock_metrics(&metrics);
    if let Some(stats) = calculate_stats_u64(&m.upload_latency_us) {
        println!(
            "│ upload latency: min {:.0} us | mean {:.0} us | max {:.0} us",
            stats.min, stats.mean, stats.max
        );
    }
    if let Some(reason) = &m.last_upload_error {
        println!("│ last upload error: {}", reason);
    }
    println!("│ capture trace: {} events dropped", orchestrator.trace().dropped());
    println!("└────────────────────────────────────────────");
}
