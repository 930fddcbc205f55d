//! Error types for indexer operations

use thiserror::Error;

/// Indexer error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid caller-supplied input (bad pagination, malformed filter)
    #[error("invalid value: {0}")]
    BadInput(String),

    /// Storage backend error (SQLite)
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Read-only connection pool error
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed stored or on-chain payload
    #[error("malformed payload: {0}")]
    Payload(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error was caused by caller input rather than storage.
    pub fn is_bad_input(&self) -> bool {
        matches!(self, Error::BadInput(_))
    }
}

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, Error>;
