//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Task was dropped before producing a result")]
    TaskLost,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl QueueError {
    pub fn task_panicked(msg: impl Into<String>) -> Self {
        Self::TaskPanicked(msg.into())
    }
}
