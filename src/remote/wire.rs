//! wire.rs
//! JSON bodies exchanged with the session service (camelCase on the wire).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Sample, SessionId, SessionSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleMetadataDto {
    pub battery_level: Option<u8>,
    pub signal_strength: Option<u8>,
}

/// One sample on the wire. `id` lets the service drop duplicates of a retried batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleDto {
    pub id: Uuid,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub channels: Vec<f64>,
    pub quality: Option<f64>,
    pub metadata: Option<SampleMetadataDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSamplesRequest {
    pub samples: Vec<SampleDto>,
}

impl CreateSamplesRequest {
    pub fn from_samples(samples: &[Sample]) -> Self {
        Self {
            samples: samples.iter().map(Sample::to_dto).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishSessionRequest {
    pub ended_at: Option<String>,
    pub summary: Option<SessionSummary>,
}

impl FinishSessionRequest {
    pub fn new(ended_at: DateTime<Utc>, summary: Option<SessionSummary>) -> Self {
        Self {
            ended_at: Some(ended_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            summary,
        }
    }
}

/// Acknowledgement of an accepted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub received: usize,
    pub session_id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelKind, DeviceStatus};
    use chrono::TimeZone;

    #[test]
    fn sample_batch_serializes_in_camel_case() {
        let sample = Sample::new(
            SessionId::new("s-9"),
            Utc::now(),
            ChannelKind::Optical,
            vec![1.0, 2.0, 3.0],
            None,
            Some(DeviceStatus {
                battery_level: Some(87),
                signal_strength: Some(4),
            }),
        );
        let body = serde_json::to_value(CreateSamplesRequest::from_samples(&[sample])).unwrap();
        let first = &body["samples"][0];
        assert_eq!(first["type"], "PPG");
        assert_eq!(first["metadata"]["batteryLevel"], 87);
        assert_eq!(first["metadata"]["signalStrength"], 4);
        assert!(first["quality"].is_null());
    }

    #[test]
    fn finish_request_uses_rfc3339_utc() {
        let ended = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let req = FinishSessionRequest::new(ended, None);
        assert_eq!(req.ended_at.as_deref(), Some("2024-03-01T09:30:00Z"));
    }
}
