//! Error types for the Bright Data client.

use thiserror::Error;

/// Result type for Bright Data client operations.
pub type Result<T> = std::result::Result<T, BrightDataError>;

/// Bright Data client errors.
#[derive(Debug, Error)]
pub enum BrightDataError {
    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// API error (non-2xx response)
    #[error("Bright Data API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A snapshot finished in a failed state
    #[error("Snapshot {0} failed")]
    SnapshotFailed(String),

    /// Parse error (unexpected response shape)
    #[error("Parse error: {0}")]
    Parse(String),
}
