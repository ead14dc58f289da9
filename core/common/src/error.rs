//! Common error types for Waypoint.

use thiserror::Error;

/// Top-level error type for Waypoint operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote fetch failed or did not complete.
    #[error("Network error: {0}")]
    Network(String),

    /// A foreign key did not resolve or a unique key was duplicated.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The storage engine rejected or failed a write or read.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller detached before the work completed.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Whether the error came from the local store rather than the network.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Persistence(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
