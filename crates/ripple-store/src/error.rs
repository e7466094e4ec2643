//! Error types for ripple-store

use thiserror::Error;

/// Errors that can occur in the history persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No history entry exists for the execution id
    #[error("history entry not found for execution: {execution_id}")]
    NotFound { execution_id: String },

    /// A history key could not be used as a file name
    #[error("invalid history key: {key}")]
    InvalidKey { key: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}
