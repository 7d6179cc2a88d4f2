//! simulated.rs
//! Simulated wearable band: a stand-in for the vendor SDK.
//! - radio thread: serves scan / connect / disconnect commands in order (crossbeam channel)
//! - frame thread: periodic release with SpinSleeper, one primary-signal frame per tick,
//!   motion / angular-rate every 5th tick, optical every 10th
//! - late ticks are counted, not caught up

use crossbeam::channel::{unbounded, Receiver, Sender};
use chrono::Utc;
use log::{debug, info};
use parking_lot::Mutex;
use rand::random_range;
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::device::link::{ConnectionState, DeviceInfo, DeviceLink, Frame, LinkCore, LinkEvents};
use crate::model::{ChannelKind, DeviceStatus};

#[derive(Debug, Clone)]
pub struct SimulatedBandConfig {
    pub frame_interval: Duration,
    pub connect_delay: Duration,
    pub discovery_delay: Duration,
    pub event_capacity: usize,
}

impl Default for SimulatedBandConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(5),
            connect_delay: Duration::from_millis(150),
            discovery_delay: Duration::from_millis(100),
            event_capacity: 1024,
        }
    }
}

/// A device the simulated radio advertises during a scan.
#[derive(Debug, Clone)]
pub struct Advertised {
    pub info: DeviceInfo,
    pub reachable: bool,
}

enum RadioCommand {
    Scan,
    Connect(DeviceInfo),
    Disconnect,
    Shutdown,
}

struct FrameWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SimulatedBand {
    core: Arc<LinkCore>,
    radio_tx: Sender<RadioCommand>,
    radio_handle: Mutex<Option<JoinHandle<()>>>,
    late_ticks: Arc<AtomicU64>,
}

impl SimulatedBand {
    pub fn new(config: SimulatedBandConfig, advertised: Vec<Advertised>) -> Self {
        let core = Arc::new(LinkCore::new(config.event_capacity));
        let late_ticks = Arc::new(AtomicU64::new(0));
        let (radio_tx, radio_rx) = unbounded();

        let radio = Radio {
            core: core.clone(),
            config,
            advertised,
            late_ticks: late_ticks.clone(),
            worker: None,
        };
        let handle = thread::spawn(move || radio.run(radio_rx));

        Self {
            core,
            radio_tx,
            radio_handle: Mutex::new(Some(handle)),
            late_ticks,
        }
    }

    /// A band advertising one reachable Muse S.
    pub fn single(config: SimulatedBandConfig) -> (Self, DeviceInfo) {
        let device = DeviceInfo::new("00:55:DA:B3:1C:7E", "Muse-S 1C7E");
        let band = Self::new(
            config,
            vec![Advertised {
                info: device.clone(),
                reachable: true,
            }],
        );
        (band, device)
    }

    /// Pushes a frame through the streaming gate as if the radio received it.
    pub fn inject_frame(&self, frame: Frame) -> bool {
        self.core.publish_frame(frame)
    }

    /// Drops the current connection with an error, as a lost radio link would.
    pub fn drop_connection(&self, reason: &str) {
        self.core.mark_failed(reason);
        let _ = self.radio_tx.send(RadioCommand::Disconnect);
    }

    pub fn late_ticks(&self) -> u64 {
        self.late_ticks.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.core.dropped_events()
    }
}

impl DeviceLink for SimulatedBand {
    fn start_scan(&self) {
        if self.core.begin_scan() {
            info!("[Band] scanning");
            let _ = self.radio_tx.send(RadioCommand::Scan);
        }
    }

    fn stop_scan(&self) {
        if self.core.end_scan() {
            info!("[Band] scan stopped");
        }
    }

    fn connect(&self, device: &DeviceInfo) {
        if self.core.begin_connect(device) {
            let _ = self.radio_tx.send(RadioCommand::Connect(device.clone()));
        }
    }

    fn disconnect(&self) {
        let _ = self.radio_tx.send(RadioCommand::Disconnect);
    }

    fn start_streaming(&self) {
        if !self.core.set_streaming(true) {
            info!("[Band] streaming started");
        }
    }

    fn stop_streaming(&self) {
        if self.core.set_streaming(false) {
            info!("[Band] streaming stopped");
        }
    }

    fn subscribe(&self) -> LinkEvents {
        self.core.subscribe()
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state()
    }

    fn is_scanning(&self) -> bool {
        self.core.is_scanning()
    }

    fn is_streaming(&self) -> bool {
        self.core.is_streaming()
    }
}

impl Drop for SimulatedBand {
    fn drop(&mut self) {
        let _ = self.radio_tx.send(RadioCommand::Shutdown);
        if let Some(handle) = self.radio_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Radio {
    core: Arc<LinkCore>,
    config: SimulatedBandConfig,
    advertised: Vec<Advertised>,
    late_ticks: Arc<AtomicU64>,
    worker: Option<FrameWorker>,
}

impl Radio {
    fn run(mut self, rx: Receiver<RadioCommand>) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                RadioCommand::Scan => self.scan(),
                RadioCommand::Connect(device) => self.connect(device),
                RadioCommand::Disconnect => {
                    self.stop_frames();
                    self.core.mark_disconnected();
                }
                RadioCommand::Shutdown => break,
            }
        }
        self.stop_frames();
        self.core.mark_disconnected();
        debug!("[Band] radio stopped");
    }

    fn scan(&self) {
        thread::sleep(self.config.discovery_delay);
        // advertisements repeat on air; the core reports each identity once
        for _ in 0..2 {
            for ad in &self.advertised {
                self.core.report_discovered(ad.info.clone());
            }
        }
    }

    fn connect(&mut self, device: DeviceInfo) {
        thread::sleep(self.config.connect_delay);
        let reachable = self
            .advertised
            .iter()
            .any(|ad| ad.info.id == device.id && ad.reachable);

        if !reachable {
            self.core.mark_failed(format!("device {} unreachable", device.name));
            return;
        }
        if self.core.mark_connected() {
            self.start_frames();
        }
    }

    fn start_frames(&mut self) {
        self.stop_frames();
        let running = Arc::new(AtomicBool::new(true));
        let generator = FrameGenerator {
            core: self.core.clone(),
            period: self.config.frame_interval,
            running: running.clone(),
            late_ticks: self.late_ticks.clone(),
        };
        let handle = thread::spawn(move || generator.run());
        self.worker = Some(FrameWorker { running, handle });
    }

    fn stop_frames(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            let _ = worker.handle.join();
        }
    }
}

struct FrameGenerator {
    core: Arc<LinkCore>,
    period: Duration,
    running: Arc<AtomicBool>,
    late_ticks: Arc<AtomicU64>,
}

impl FrameGenerator {
    fn run(&self) {
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        let mut next_deadline = Instant::now() + self.period;
        let mut seq: u64 = 1;
        let mut battery: f64 = 100.0;

        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            } else {
                self.late_ticks.fetch_add(1, Ordering::Relaxed);
            }

            battery = (battery - 0.0005).max(5.0);
            let status = DeviceStatus {
                battery_level: Some(battery as u8),
                signal_strength: Some(random_range(3..=5)),
            };

            for kind in kinds_for_tick(seq) {
                self.core.publish_frame(synth_frame(seq, kind, status));
            }

            next_deadline += self.period;
            seq += 1;
        }
        debug!("[Band] frame generator stopped at seq {}", seq);
    }
}

fn kinds_for_tick(seq: u64) -> Vec<ChannelKind> {
    let mut kinds = vec![ChannelKind::PrimarySignal];
    if seq % 5 == 0 {
        kinds.push(ChannelKind::Motion);
        kinds.push(ChannelKind::AngularRate);
    }
    if seq % 10 == 0 {
        kinds.push(ChannelKind::Optical);
    }
    kinds
}

fn base_value(kind: ChannelKind) -> f64 {
    match kind {
        ChannelKind::PrimarySignal => 800.0,
        ChannelKind::Motion => 0.0,
        ChannelKind::Optical => 50_000.0,
        ChannelKind::AngularRate => 0.0,
    }
}

fn noise_range(kind: ChannelKind) -> (f64, f64) {
    match kind {
        ChannelKind::PrimarySignal => (-40.0, 40.0),
        ChannelKind::Motion => (-0.05, 0.05),
        ChannelKind::Optical => (-500.0, 500.0),
        ChannelKind::AngularRate => (-2.0, 2.0),
    }
}

fn synth_frame(seq: u64, kind: ChannelKind, status: DeviceStatus) -> Frame {
    let base = base_value(kind);
    let (lo, hi) = noise_range(kind);
    let values = (0..kind.channel_count())
        .map(|_| base + random_range(lo..hi))
        .collect();

    Frame {
        seq,
        timestamp: Utc::now(),
        kind,
        values,
        quality: match kind {
            ChannelKind::PrimarySignal => Some(random_range(0.5..1.0)),
            _ => None,
        },
        device_status: Some(status),
    }
}
