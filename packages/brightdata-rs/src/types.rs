use serde::{Deserialize, Serialize};

/// A single URL entry in a trigger payload.
///
/// TikTok dataset requests must carry an explicit empty `country` field or the
/// API rejects the payload; Instagram requests omit it.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl TriggerEntry {
    pub fn instagram(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            country: None,
        }
    }

    pub fn tiktok(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            country: Some(String::new()),
        }
    }
}

/// Response from the trigger endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerResponse {
    pub snapshot_id: String,
}

/// Response from the progress endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressResponse {
    pub status: String,
    #[serde(default)]
    pub records: Option<u64>,
    #[serde(default)]
    pub errors: Option<u64>,
}

/// Snapshot lifecycle as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Collection still in progress (or an unrecognized status)
    Running,
    /// Results are available for download
    Ready,
    /// Collection failed
    Failed,
}

impl SnapshotStatus {
    /// Map the provider's status string. `ready` and `completed` both mean
    /// downloadable; anything unrecognized is treated as still running.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "ready" | "completed" => SnapshotStatus::Ready,
            "failed" => SnapshotStatus::Failed,
            _ => SnapshotStatus::Running,
        }
    }
}
