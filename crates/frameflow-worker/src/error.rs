//! Worker error types.

use thiserror::Error;

use frameflow_media::MediaError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown handler is already installed")]
    ShutdownAlreadyInstalled,

    #[error("Too many failed frames: {failed} of {seen} (limit {max_ratio})")]
    FailureThresholdExceeded { failed: u64, seen: u64, max_ratio: f64 },

    #[error("Storage error: {0}")]
    Storage(#[from] frameflow_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] frameflow_queue::QueueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if the error comes from the task or worker configuration.
    ///
    /// Such errors surface before any frame is processed and retrying the
    /// same task will not help.
    pub fn is_config_error(&self) -> bool {
        match self {
            WorkerError::ConfigError(_) => true,
            WorkerError::Media(e) => matches!(
                e,
                MediaError::UnknownStep(_)
                    | MediaError::InvalidConfig(_)
                    | MediaError::ModelNotFound(_)
                    | MediaError::ModelChecksumMismatch { .. }
                    | MediaError::BackendUnavailable(_)
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(WorkerError::config_error("no steps").is_config_error());
        assert!(WorkerError::from(MediaError::unknown_step("blur")).is_config_error());
        assert!(!WorkerError::from(MediaError::inference("nan")).is_config_error());
        assert!(!WorkerError::ShutdownAlreadyInstalled.is_config_error());
        assert!(!WorkerError::from(std::io::Error::other("disk full")).is_config_error());
    }
}
