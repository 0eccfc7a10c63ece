//! Shared data models for the frameflow job engine.
//!
//! This crate provides Serde-serializable types for:
//! - Tasks, steps and task lifecycle states
//! - Execution configuration and session cache keys
//! - Checkpoint records
//! - Shutdown states
//! - Per-task metrics reports

pub mod checkpoint;
pub mod execution;
pub mod metrics;
pub mod shutdown;
pub mod task;

// Re-export common types
pub use checkpoint::{CheckpointRecord, CHECKPOINT_FORMAT_VERSION};
pub use execution::{ExecutionConfig, ExecutionProvider, SessionKey};
pub use metrics::{
    FrameSummary, GpuMemorySample, MetricsSnapshot, ResourceUsage, StepLatency,
    METRICS_SCHEMA_VERSION,
};
pub use shutdown::ShutdownState;
pub use task::{StepConfig, TaskConfig, TaskId, TaskState};
