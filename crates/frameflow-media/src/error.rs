//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during frame processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Unknown processing step: {0}")]
    UnknownStep(String),

    #[error("Invalid step configuration: {0}")]
    InvalidConfig(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model checksum mismatch for {path}: expected {expected}, got {actual}")]
    ModelChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("{in_use} session(s) still checked out")]
    SessionsInUse { in_use: usize },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create an unknown step error.
    pub fn unknown_step(id: impl Into<String>) -> Self {
        Self::UnknownStep(id.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a model not found error.
    pub fn model_not_found(name: impl Into<String>) -> Self {
        Self::ModelNotFound(name.into())
    }

    /// Create a session creation error.
    pub fn session_creation(message: impl Into<String>) -> Self {
        Self::SessionCreation(message.into())
    }

    /// Create an inference error.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference(message.into())
    }

    /// Create an invalid frame error.
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error only affects the frame being processed.
    ///
    /// Frame-local errors mark the frame failed and processing continues;
    /// anything else aborts the task.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, MediaError::Inference(_) | MediaError::InvalidFrame(_))
    }
}

impl Clone for MediaError {
    // Needed so every waiter of a single-flight session load receives the
    // same failure. Non-cloneable sources are flattened to their message.
    fn clone(&self) -> Self {
        match self {
            Self::UnknownStep(s) => Self::UnknownStep(s.clone()),
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::ModelNotFound(s) => Self::ModelNotFound(s.clone()),
            Self::ModelChecksumMismatch {
                path,
                expected,
                actual,
            } => Self::ModelChecksumMismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::BackendUnavailable(s) => Self::BackendUnavailable(s.clone()),
            Self::SessionCreation(s) => Self::SessionCreation(s.clone()),
            Self::SessionsInUse { in_use } => Self::SessionsInUse { in_use: *in_use },
            Self::Inference(s) => Self::Inference(s.clone()),
            Self::InvalidFrame(s) => Self::InvalidFrame(s.clone()),
            Self::FileNotFound(p) => Self::FileNotFound(p.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::JsonParse(e) => Self::Internal(format!("JSON parse error: {}", e)),
            Self::Internal(s) => Self::Internal(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_local_classification() {
        assert!(MediaError::inference("nan output").is_frame_local());
        assert!(MediaError::invalid_frame("empty").is_frame_local());
        assert!(!MediaError::model_not_found("x").is_frame_local());
        assert!(!MediaError::session_creation("x").is_frame_local());
    }
}
