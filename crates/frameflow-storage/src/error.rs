//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Checkpoint is corrupt: {0}")]
    Corrupt(String),

    #[error("Checkpoint integrity check failed (expected {expected}, found {actual})")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Unsupported checkpoint version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}
