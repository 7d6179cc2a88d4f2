//! session.rs
//! One capture session as the remote service sees it, plus the small value
//! types (type, device model, summary, metadata) that travel with it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, RemoteResult};

/// Identifier assigned by the remote service on create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionType {
    #[default]
    #[serde(rename = "training_5min")]
    Training5Min,
    #[serde(rename = "meditation")]
    Meditation,
    #[serde(rename = "custom")]
    Custom,
}

impl SessionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "training_5min" | "training" => Some(Self::Training5Min),
            "meditation" => Some(Self::Meditation),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Device model tag stored on the session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    #[serde(rename = "muse_s_athena")]
    MuseS,
    #[serde(rename = "muse_2")]
    Muse2,
    #[serde(rename = "muse_2016")]
    Muse2016,
}

impl DeviceModel {
    /// Infers the model from the advertised name. Unknown names fall back to the 2016 band.
    pub fn infer_from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("muse s") || lower.contains("muse-s") {
            DeviceModel::MuseS
        } else if lower.contains("muse 2") || lower.contains("muse-2") {
            DeviceModel::Muse2
        } else {
            DeviceModel::Muse2016
        }
    }
}

/// Aggregate metrics computed client-side and attached on finish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub avg_focus: Option<f64>,
    pub max_focus: Option<f64>,
    pub min_focus: Option<f64>,
    pub total_samples: Option<u64>,
    pub good_sample_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub app_version: Option<String>,
    pub sdk_version: Option<String>,
    pub device_model: Option<String>,
    pub os_version: Option<String>,
}

impl SessionMetadata {
    /// Metadata describing the host this process runs on.
    pub fn for_host(app_version: &str, sdk_version: Option<&str>) -> Self {
        Self {
            app_version: Some(app_version.to_string()),
            sdk_version: sdk_version.map(str::to_string),
            device_model: Some(std::env::consts::ARCH.to_string()),
            os_version: Some(std::env::consts::OS.to_string()),
        }
    }
}

/// Parameters of a remote create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub user_id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub device: DeviceModel,
    pub metadata: Option<SessionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Option<SessionId>,
    pub user_id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub device: DeviceModel,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<SessionSummary>,
    pub metadata: Option<SessionMetadata>,
    pub notes: Option<String>,
}

impl Session {
    /// A session record that has not been acknowledged by the remote yet.
    pub fn pending(request: &NewSession, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            user_id: request.user_id.clone(),
            session_type: request.session_type,
            device: request.device,
            status: SessionStatus::Active,
            started_at,
            ended_at: None,
            summary: None,
            metadata: request.metadata.clone(),
            notes: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Whole seconds between start and end, if the session has ended.
    pub fn calculated_duration(&self) -> Option<i64> {
        self.ended_at
            .map(|end| end.signed_duration_since(self.started_at).num_seconds())
    }

    /// "m:ss", or "--:--" while the session is still open.
    pub fn formatted_duration(&self) -> String {
        match self.calculated_duration() {
            Some(secs) if secs >= 0 => format!("{}:{:02}", secs / 60, secs % 60),
            _ => "--:--".to_string(),
        }
    }

    pub fn finish(
        &mut self,
        ended_at: DateTime<Utc>,
        summary: Option<SessionSummary>,
    ) -> RemoteResult<()> {
        self.close(SessionStatus::Finished, ended_at)?;
        self.summary = summary;
        Ok(())
    }

    pub fn abort(&mut self, ended_at: DateTime<Utc>) -> RemoteResult<()> {
        self.close(SessionStatus::Aborted, ended_at)
    }

    // terminal once status leaves Active
    fn close(&mut self, status: SessionStatus, ended_at: DateTime<Utc>) -> RemoteResult<()> {
        if !self.is_active() {
            return Err(RemoteError::InvalidState(format!(
                "session is {:?}, cannot move to {:?}",
                self.status, status
            )));
        }
        self.status = status;
        self.ended_at = Some(ended_at);
        Ok(())
    }
}
