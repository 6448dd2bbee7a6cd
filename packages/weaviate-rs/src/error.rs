//! Error types for the Weaviate client.

use thiserror::Error;

/// Result type for Weaviate client operations.
pub type Result<T> = std::result::Result<T, WeaviateError>;

/// Weaviate client errors.
#[derive(Debug, Error)]
pub enum WeaviateError {
    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// API error (non-2xx response)
    #[error("Weaviate API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// GraphQL-level errors in an otherwise successful response
    #[error("Weaviate GraphQL error: {0}")]
    GraphQL(String),

    /// Parse error (unexpected response shape)
    #[error("Parse error: {0}")]
    Parse(String),
}
