//! Pure Bright Data dataset API client.
//!
//! A minimal client for Bright Data's asynchronous dataset collection API.
//! Supports triggering a collection for a batch of profile URLs, polling the
//! snapshot's progress, and downloading the collected records.
//!
//! # Example
//!
//! ```rust,ignore
//! use brightdata::{BrightDataClient, TriggerEntry};
//!
//! let client = BrightDataClient::new("your-api-token".into());
//!
//! let entries: Vec<_> = urls.iter().map(TriggerEntry::instagram).collect();
//! let snapshot_id = client.trigger("gd_instagram_dataset", &entries).await?;
//! // ... poll client.progress(&snapshot_id) until Ready ...
//! let profiles: Vec<serde_json::Value> = client.download(&snapshot_id).await?;
//! ```

pub mod error;
pub mod types;

pub use error::{BrightDataError, Result};
pub use types::{ProgressResponse, SnapshotStatus, TriggerEntry, TriggerResponse};

use std::time::Duration;

use serde::de::DeserializeOwned;

const BASE_URL: &str = "https://api.brightdata.com/datasets/v3";

const TRIGGER_TIMEOUT: Duration = Duration::from_secs(120);
const PROGRESS_TIMEOUT: Duration = Duration::from_secs(300);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub struct BrightDataClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl BrightDataClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Set a custom base URL (for tests and proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Trigger an asynchronous collection for a batch of URLs.
    ///
    /// Returns immediately with the snapshot id; the collection runs on the
    /// provider's side and must be polled via [`progress`](Self::progress).
    pub async fn trigger(&self, dataset_id: &str, entries: &[TriggerEntry]) -> Result<String> {
        let url = format!(
            "{}/trigger?dataset_id={}&include_errors=true",
            self.base_url, dataset_id
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(TRIGGER_TIMEOUT)
            .json(entries)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrightDataError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let trigger: TriggerResponse = resp.json().await?;
        tracing::debug!(
            dataset_id,
            snapshot_id = %trigger.snapshot_id,
            urls = entries.len(),
            "Triggered dataset collection"
        );
        Ok(trigger.snapshot_id)
    }

    /// Check the progress of a triggered snapshot.
    pub async fn progress(&self, snapshot_id: &str) -> Result<SnapshotStatus> {
        let url = format!("{}/progress/{}", self.base_url, snapshot_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(PROGRESS_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrightDataError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let progress: ProgressResponse = resp.json().await?;
        Ok(SnapshotStatus::from_provider(&progress.status))
    }

    /// Download the records of a ready snapshot.
    pub async fn download<T: DeserializeOwned>(&self, snapshot_id: &str) -> Result<Vec<T>> {
        let url = format!("{}/snapshot/{}?format=json", self.base_url, snapshot_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrightDataError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let records: Vec<T> = resp.json().await?;
        tracing::debug!(snapshot_id, count = records.len(), "Downloaded snapshot");
        Ok(records)
    }
}
