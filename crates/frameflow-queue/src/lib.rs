//! Worker pool for frame-level parallelism.
//!
//! This crate provides:
//! - A fixed set of named worker threads draining one FIFO queue
//! - Fire-and-forget `enqueue` and result-returning `submit`
//! - Panic containment, idle waiting and draining shutdown

pub mod error;
pub mod pool;

pub use error::{QueueError, QueueResult};
pub use pool::{TaskHandle, WorkerPool};
