//! config.rs
//! Capture pipeline settings. Defaults mirror the training app (50-sample
//! batches, 5-minute sessions); every field can be overridden from `CAPTURE_*`
//! environment variables.

use std::{env, path::PathBuf, time::Duration};

use crate::error::ConfigError;
use crate::model::SessionType;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_SESSION_SECS: u64 = 300;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_BUFFER_WARN: usize = 5_000;
pub const DEFAULT_CHART_POINTS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Buffer length that triggers a drain-and-upload; also the batch size.
    pub batch_size: usize,
    /// Planned training duration, used for the countdown.
    pub session_duration: Duration,
    /// Capacity of each device event subscription.
    pub event_capacity: usize,
    /// Buffer length above which growth is logged.
    pub buffer_warn_len: usize,
    /// Points kept for the live chart.
    pub chart_points: usize,
    pub user_id: String,
    pub session_type: SessionType,
    pub app_version: String,
    pub sdk_version: Option<String>,
    /// Capture trace CSV written by the demo binary.
    pub trace_csv: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            session_duration: Duration::from_secs(DEFAULT_SESSION_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            buffer_warn_len: DEFAULT_BUFFER_WARN,
            chart_points: DEFAULT_CHART_POINTS,
            user_id: "local-user".to_string(),
            session_type: SessionType::Training5Min,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            sdk_version: None,
            trace_csv: None,
        }
    }
}

impl CaptureConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("CAPTURE_BATCH_SIZE") {
            cfg.batch_size = parse_ranged("CAPTURE_BATCH_SIZE", &v, 1, 10_000)? as usize;
        }
        if let Some(v) = lookup("CAPTURE_SESSION_SECS") {
            cfg.session_duration =
                Duration::from_secs(parse_ranged("CAPTURE_SESSION_SECS", &v, 1, 24 * 3600)?);
        }
        if let Some(v) = lookup("CAPTURE_EVENT_CAPACITY") {
            cfg.event_capacity = parse_ranged("CAPTURE_EVENT_CAPACITY", &v, 1, 1 << 20)? as usize;
        }
        if let Some(v) = lookup("CAPTURE_BUFFER_WARN") {
            cfg.buffer_warn_len = parse_ranged("CAPTURE_BUFFER_WARN", &v, 1, u32::MAX as u64)? as usize;
        }
        if let Some(v) = lookup("CAPTURE_CHART_POINTS") {
            cfg.chart_points = parse_ranged("CAPTURE_CHART_POINTS", &v, 1, 10_000)? as usize;
        }
        if let Some(v) = lookup("CAPTURE_USER_ID") {
            if v.trim().is_empty() {
                return Err(ConfigError::InvalidValue { key: "CAPTURE_USER_ID", value: v });
            }
            cfg.user_id = v.trim().to_string();
        }
        if let Some(v) = lookup("CAPTURE_SESSION_TYPE") {
            cfg.session_type = SessionType::parse(&v)
                .ok_or(ConfigError::InvalidValue { key: "CAPTURE_SESSION_TYPE", value: v })?;
        }
        if let Some(v) = lookup("CAPTURE_SDK_VERSION") {
            cfg.sdk_version = Some(v);
        }
        if let Some(v) = lookup("CAPTURE_TRACE_CSV") {
            cfg.trace_csv = (!v.is_empty()).then(|| PathBuf::from(v));
        }

        Ok(cfg)
    }
}

fn parse_ranged(key: &'static str, raw: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { key, value, min, max });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_training_app() {
        let cfg = CaptureConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.session_duration, Duration::from_secs(300));
        assert_eq!(cfg.session_type, SessionType::Training5Min);
        assert!(cfg.trace_csv.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = CaptureConfig::from_lookup(lookup(&[
            ("CAPTURE_BATCH_SIZE", "25"),
            ("CAPTURE_SESSION_SECS", "60"),
            ("CAPTURE_SESSION_TYPE", "meditation"),
            ("CAPTURE_USER_ID", " athlete-7 "),
            ("CAPTURE_TRACE_CSV", "data/logs/trace.csv"),
        ]))
        .unwrap();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.session_duration, Duration::from_secs(60));
        assert_eq!(cfg.session_type, SessionType::Meditation);
        assert_eq!(cfg.user_id, "athlete-7");
        assert_eq!(cfg.trace_csv, Some(PathBuf::from("data/logs/trace.csv")));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert_eq!(
            CaptureConfig::from_lookup(lookup(&[("CAPTURE_BATCH_SIZE", "0")])),
            Err(ConfigError::OutOfRange { key: "CAPTURE_BATCH_SIZE", value: 0, min: 1, max: 10_000 })
        );
    }

    #[test]
    fn garbage_is_reported_with_its_key() {
        let err = CaptureConfig::from_lookup(lookup(&[("CAPTURE_EVENT_CAPACITY", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue { key: "CAPTURE_EVENT_CAPACITY", value: "lots".into() }
        );
    }
}
