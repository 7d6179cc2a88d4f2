//! trace.rs
//! Capture trace: pipeline events recorded without blocking the capture path.
//!
//! Producers push into a bounded `ArrayQueue` (an event is dropped and counted
//! when full). An optional background consumer drains the queue in batches and
//! writes CSV rows; it does a final drain when stopped.

use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crossbeam_queue::ArrayQueue;
use csv::Writer;
use log::{debug, error};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

pub const TRACE_CAPACITY: usize = 8192;
const CONSUMER_POLL_MS: u64 = 5;
const FLUSH_BATCHES: usize = 8;
const DRAIN_PER_POLL: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Transition { from: &'static str, to: &'static str },
    FrameIngested { buffered: usize },
    BatchDrained { size: usize },
    UploadSucceeded { size: usize, latency_us: u64 },
    UploadFailed { size: usize, reason: String },
    BatchRequeued { size: usize },
    BatchRejected { size: usize },
    BufferDiscarded { count: usize },
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::Transition { .. } => "transition",
            CaptureEvent::FrameIngested { .. } => "frame_ingested",
            CaptureEvent::BatchDrained { .. } => "batch_drained",
            CaptureEvent::UploadSucceeded { .. } => "upload_ok",
            CaptureEvent::UploadFailed { .. } => "upload_failed",
            CaptureEvent::BatchRequeued { .. } => "batch_requeued",
            CaptureEvent::BatchRejected { .. } => "batch_rejected",
            CaptureEvent::BufferDiscarded { .. } => "buffer_discarded",
        }
    }

    fn value(&self) -> u64 {
        match self {
            CaptureEvent::Transition { .. } => 0,
            CaptureEvent::FrameIngested { buffered } => *buffered as u64,
            CaptureEvent::UploadSucceeded { latency_us, .. } => *latency_us,
            CaptureEvent::BatchDrained { size }
            | CaptureEvent::UploadFailed { size, .. }
            | CaptureEvent::BatchRequeued { size }
            | CaptureEvent::BatchRejected { size } => *size as u64,
            CaptureEvent::BufferDiscarded { count } => *count as u64,
        }
    }

    fn detail(&self) -> String {
        match self {
            CaptureEvent::Transition { from, to } => format!("{}->{}", from, to),
            CaptureEvent::UploadFailed { reason, .. } => reason.clone(),
            CaptureEvent::UploadSucceeded { size, .. } => format!("size={}", size),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub seq: u64,
    pub at: Instant,
    pub event: CaptureEvent,
}

#[derive(Serialize)]
struct CsvRow {
    seq: u64,
    ts_epoch_us: u64,
    age_us: u64,
    event: &'static str,
    value: u64,
    detail: String,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace consumer already running")]
    AlreadyRunning,
    #[error("cannot open trace file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CaptureTrace {
    queue: Arc<ArrayQueue<TraceEntry>>,
    seq: AtomicU64,
    dropped: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CaptureTrace {
    fn default() -> Self {
        Self::new(TRACE_CAPACITY)
    }
}

impl CaptureTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            seq: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
        }
    }

    /// Non-blocking; drops the event when the queue is full.
    #[inline]
    pub fn record(&self, event: CaptureEvent) {
        let entry = TraceEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            at: Instant::now(),
            event,
        };
        if self.queue.push(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pops everything currently queued. Only meaningful with no consumer running.
    pub fn drain(&self) -> Vec<TraceEntry> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(entry) = self.queue.pop() {
            out.push(entry);
        }
        out
    }

    pub fn start_exporter(&self, output_csv: &Path) -> Result<(), TraceError> {
        let mut guard = self.consumer.lock();
        if guard.is_some() {
            return Err(TraceError::AlreadyRunning);
        }

        let file = File::create(output_csv)?;
        let queue = self.queue.clone();
        let dropped = self.dropped.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        *guard = Some(thread::spawn(move || {
            let mut wtr = Writer::from_writer(BufWriter::new(file));
            let mut flush_counter = 0usize;

            while running.load(Ordering::SeqCst) {
                let mut any = false;
                for _ in 0..DRAIN_PER_POLL {
                    match queue.pop() {
                        Some(entry) => {
                            any = true;
                            write_row(&mut wtr, entry);
                        }
                        None => break,
                    }
                }
                if any {
                    flush_counter += 1;
                    if flush_counter >= FLUSH_BATCHES {
                        if let Err(e) = wtr.flush() {
                            error!("[Trace] flush failed: {}", e);
                        }
                        flush_counter = 0;
                    }
                } else {
                    thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
                }
            }

            while let Some(entry) = queue.pop() {
                write_row(&mut wtr, entry);
            }
            if let Err(e) = wtr.flush() {
                error!("[Trace] final flush failed: {}", e);
            }
            debug!("[Trace] exporter exiting, dropped={}", dropped.load(Ordering::Relaxed));
        }));
        Ok(())
    }

    /// Stops the exporter after it has written everything still queued.
    pub fn stop_exporter(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureTrace {
    fn drop(&mut self) {
        self.stop_exporter();
    }
}

fn write_row<W: std::io::Write>(wtr: &mut Writer<W>, entry: TraceEntry) {
    let ts_epoch_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let row = CsvRow {
        seq: entry.seq,
        ts_epoch_us,
        age_us: entry.at.elapsed().as_micros() as u64,
        event: entry.event.name(),
        value: entry.event.value(),
        detail: entry.event.detail(),
    };
    if let Err(e) = wtr.serialize(&row) {
        error!("[Trace] write failed: {}", e);
    }
}
