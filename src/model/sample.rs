//! sample.rs
//! A captured reading tagged with its session. Immutable once built; the
//! sample buffer owns it until a batch is delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::Frame;
use crate::model::SessionId;
use crate::remote::wire::{SampleDto, SampleMetadataDto};

/// Quality at or above this counts as a good sample.
pub const GOOD_QUALITY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "EEG")]
    PrimarySignal,
    #[serde(rename = "ACC")]
    Motion,
    #[serde(rename = "PPG")]
    Optical,
    #[serde(rename = "GYRO")]
    AngularRate,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::PrimarySignal,
        ChannelKind::Motion,
        ChannelKind::Optical,
        ChannelKind::AngularRate,
    ];

    /// Tag used on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelKind::PrimarySignal => "EEG",
            ChannelKind::Motion => "ACC",
            ChannelKind::Optical => "PPG",
            ChannelKind::AngularRate => "GYRO",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag().eq_ignore_ascii_case(tag))
    }

    pub fn channel_count(&self) -> usize {
        match self {
            ChannelKind::PrimarySignal => 4,
            ChannelKind::Motion | ChannelKind::Optical | ChannelKind::AngularRate => 3,
        }
    }
}

/// Battery and radio state reported alongside a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub battery_level: Option<u8>,
    pub signal_strength: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    id: Uuid,
    session_id: SessionId,
    captured_at: DateTime<Utc>,
    kind: ChannelKind,
    channels: Vec<f64>,
    quality: Option<f64>,
    device_status: Option<DeviceStatus>,
}

impl Sample {
    pub fn new(
        session_id: SessionId,
        captured_at: DateTime<Utc>,
        kind: ChannelKind,
        channels: Vec<f64>,
        quality: Option<f64>,
        device_status: Option<DeviceStatus>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            captured_at,
            kind,
            channels,
            quality: normalize_quality(quality),
            device_status,
        }
    }

    /// Tags a device frame with the owning session.
    pub fn from_frame(session_id: SessionId, frame: &Frame) -> Self {
        Self::new(
            session_id,
            frame.timestamp,
            frame.kind,
            frame.values.clone(),
            frame.quality,
            frame.device_status,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn channels(&self) -> &[f64] {
        &self.channels
    }

    pub fn quality(&self) -> Option<f64> {
        self.quality
    }

    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.device_status
    }

    pub fn has_good_quality(&self) -> bool {
        self.quality.is_some_and(|q| q >= GOOD_QUALITY)
    }

    /// Seconds since the Unix epoch, millisecond precision.
    pub fn unix_timestamp(&self) -> f64 {
        self.captured_at.timestamp_millis() as f64 / 1_000.0
    }

    pub fn to_dto(&self) -> SampleDto {
        SampleDto {
            id: self.id,
            timestamp: self.unix_timestamp(),
            kind: self.kind.tag().to_string(),
            channels: self.channels.clone(),
            quality: self.quality,
            metadata: self.device_status.map(|s| SampleMetadataDto {
                battery_level: s.battery_level,
                signal_strength: s.signal_strength,
            }),
        }
    }
}

// out-of-range scores are clamped, NaN means "no score"
fn normalize_quality(quality: Option<f64>) -> Option<f64> {
    quality.filter(|q| !q.is_nan()).map(|q| q.clamp(0.0, 1.0))
}
