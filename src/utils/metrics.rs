//! Live capture metrics for the presentation layer and the session summary.
//!
//! Two independent paths:
//! - **FrameCounters:** lock-free per-channel-kind frame counts (DashMap of atomics).
//! - **CaptureMetrics:** shared mutex state for charts, signal quality and upload health,
//!   bounded to the most recent points per series.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use dashmap::DashMap;
use serde::Serialize;

use crate::device::Frame;
use crate::model::{ChannelKind, SessionSummary, GOOD_QUALITY};

pub type SharedMetrics = Arc<Mutex<CaptureMetrics>>;

pub const MAX_POINTS: usize = 1_000;

/// One point of the live primary-signal chart (mean across channels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    /// Unix seconds.
    pub time: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureMetrics {
    pub chart: VecDeque<ChartPoint>,
    pub chart_capacity: usize,

    /// Primary-signal frames seen this session.
    pub primary_frames: u64,
    pub frames_total: u64,

    /// Running mean of reported quality scores.
    pub avg_quality: f64,
    pub quality_samples: u64,
    pub good_quality_samples: u64,
    /// 1..=5 bars derived from the latest quality score.
    pub signal_strength: u8,
    pub battery_level: Option<u8>,

    pub batches_sent: u64,
    pub batches_failed: u64,
    pub samples_delivered: u64,
    pub samples_requeued: u64,
    pub samples_discarded: u64,
    pub upload_latency_us: VecDeque<u64>,
    pub last_upload_error: Option<String>,
}

impl CaptureMetrics {
    pub fn with_chart_capacity(chart_capacity: usize) -> Self {
        Self {
            chart_capacity: chart_capacity.max(1),
            ..Self::default()
        }
    }

    pub fn shared(chart_capacity: usize) -> SharedMetrics {
        Arc::new(Mutex::new(Self::with_chart_capacity(chart_capacity)))
    }

    /// Clears per-session series; keeps configuration.
    pub fn reset(&mut self) {
        *self = Self::with_chart_capacity(self.chart_capacity);
    }

    pub fn record_frame(&mut self, frame: &Frame) {
        self.frames_total += 1;
        if let Some(battery) = frame.device_status.and_then(|s| s.battery_level) {
            self.battery_level = Some(battery);
        }
        if frame.kind != ChannelKind::PrimarySignal {
            return;
        }

        self.primary_frames += 1;
        if let Some(q) = frame.quality.filter(|q| !q.is_nan()) {
            let q = q.clamp(0.0, 1.0);
            self.quality_samples += 1;
            self.avg_quality += (q - self.avg_quality) / self.quality_samples as f64;
            if q >= GOOD_QUALITY {
                self.good_quality_samples += 1;
            }
            self.signal_strength = signal_strength_bars(q);
        }

        if !frame.values.is_empty() {
            let value = frame.values.iter().sum::<f64>() / frame.values.len() as f64;
            let time = frame.timestamp.timestamp_millis() as f64 / 1_000.0;
            if self.chart.len() >= self.chart_capacity.max(1) {
                self.chart.pop_front();
            }
            self.chart.push_back(ChartPoint { time, value });
        }
    }

    pub fn record_upload_ok(&mut self, count: usize, latency_us: u64) {
        self.batches_sent += 1;
        self.samples_delivered += count as u64;
        push_capped_u64(&mut self.upload_latency_us, latency_us);
    }

    pub fn record_upload_failed(&mut self, count: usize, reason: &str, requeued: bool) {
        self.batches_failed += 1;
        if requeued {
            self.samples_requeued += count as u64;
        } else {
            self.samples_discarded += count as u64;
        }
        self.last_upload_error = Some(reason.to_string());
    }

    pub fn record_discarded(&mut self, count: usize) {
        self.samples_discarded += count as u64;
    }

    /// Fraction of quality-scored primary frames at or above the good-quality cut-off.
    pub fn good_sample_rate(&self) -> Option<f64> {
        (self.quality_samples > 0)
            .then(|| self.good_quality_samples as f64 / self.quality_samples as f64)
    }

    /// Client-side summary attached when a session finishes.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            avg_focus: None,
            max_focus: None,
            min_focus: None,
            total_samples: Some(self.primary_frames),
            good_sample_rate: self.good_sample_rate(),
        }
    }
}

/// Locks shared metrics, recovering from a poisoned mutex.
pub fn lock_metrics(metrics: &SharedMetrics) -> MutexGuard<'_, CaptureMetrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Maps a quality score to 1..=5 signal bars.
pub fn signal_strength_bars(quality: f64) -> u8 {
    match quality {
        q if q >= 0.9 => 5,
        q if q >= 0.7 => 4,
        q if q >= 0.5 => 3,
        q if q >= 0.3 => 2,
        _ => 1,
    }
}

/// Lock-free frame counts per channel kind.
#[derive(Default)]
pub struct FrameCounters {
    counts: DashMap<ChannelKind, AtomicU64>,
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, kind: ChannelKind) {
        self.counts
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: ChannelKind) -> u64 {
        self.counts
            .get(&kind)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(ChannelKind, u64)> {
        ChannelKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind)))
            .collect()
    }

    pub fn reset(&self) {
        self.counts.clear();
    }
}

/// Appends u64 value to a metrics series; removes oldest if at capacity.
#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Statistics summary for a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes min, max, mean for a u64 series (cast to f64).
pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(kind: ChannelKind, values: Vec<f64>, quality: Option<f64>) -> Frame {
        Frame {
            seq: 0,
            timestamp: Utc::now(),
            kind,
            values,
            quality,
            device_status: None,
        }
    }

    #[test]
    fn signal_bars_follow_quality_bands() {
        assert_eq!(signal_strength_bars(0.95), 5);
        assert_eq!(signal_strength_bars(0.7), 4);
        assert_eq!(signal_strength_bars(0.55), 3);
        assert_eq!(signal_strength_bars(0.3), 2);
        assert_eq!(signal_strength_bars(0.1), 1);
    }

    #[test]
    fn only_primary_frames_feed_chart_and_quality() {
        let mut m = CaptureMetrics::with_chart_capacity(10);
        m.record_frame(&frame(ChannelKind::Motion, vec![1.0, 1.0, 1.0], Some(0.1)));
        m.record_frame(&frame(ChannelKind::PrimarySignal, vec![2.0, 4.0], Some(1.0)));
        m.record_frame(&frame(ChannelKind::PrimarySignal, vec![0.0, 0.0], Some(0.5)));

        assert_eq!(m.frames_total, 3);
        assert_eq!(m.primary_frames, 2);
        assert_eq!(m.chart.len(), 2);
        assert_eq!(m.chart[0].value, 3.0);
        assert!((m.avg_quality - 0.75).abs() < 1e-9);
        assert_eq!(m.good_sample_rate(), Some(0.5));
        assert_eq!(m.signal_strength, 3);
    }

    #[test]
    fn chart_keeps_latest_points() {
        let mut m = CaptureMetrics::with_chart_capacity(3);
        for i in 0..5 {
            m.record_frame(&frame(ChannelKind::PrimarySignal, vec![i as f64], None));
        }
        let values: Vec<f64> = m.chart.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn summary_reports_primary_frame_count() {
        let mut m = CaptureMetrics::with_chart_capacity(5);
        m.record_frame(&frame(ChannelKind::PrimarySignal, vec![1.0], Some(0.9)));
        let summary = m.summary();
        assert_eq!(summary.total_samples, Some(1));
        assert_eq!(summary.good_sample_rate, Some(1.0));
        assert!(summary.avg_focus.is_none());
    }

    #[test]
    fn upload_outcomes_are_counted() {
        let mut m = CaptureMetrics::default();
        m.record_upload_ok(50, 1_200);
        m.record_upload_ok(50, 800);
        m.record_upload_failed(20, "timeout", true);
        m.record_upload_failed(5, "timeout", false);

        assert_eq!(m.samples_delivered, 100);
        assert_eq!(m.samples_requeued, 20);
        assert_eq!(m.samples_discarded, 5);
        let stats = calculate_stats_u64(&m.upload_latency_us).unwrap();
        assert_eq!(stats.mean, 1_000.0);
        assert_eq!(stats.count, 2);
    }

    #[test]
    fn frame_counters_are_per_kind() {
        let c = FrameCounters::new();
        c.record(ChannelKind::Optical);
        c.record(ChannelKind::Optical);
        c.record(ChannelKind::PrimarySignal);
        assert_eq!(c.get(ChannelKind::Optical), 2);
        assert_eq!(c.get(ChannelKind::AngularRate), 0);
        c.reset();
        assert_eq!(c.snapshot().iter().map(|(_, n)| n).sum::<u64>(), 0);
    }
}
