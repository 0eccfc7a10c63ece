//! Frame pipeline worker.
//!
//! This crate provides:
//! - `PipelineRunner`: runs a task's steps over a frame stream with
//!   checkpointed resume and failure accounting
//! - `ShutdownController`: process-wide cooperative shutdown with a deadline
//! - `MetricsCollector`: per-task frame, latency and GPU memory report
//! - Prometheus telemetry, structured logging and configuration
//! - Built-in processing steps

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod shutdown;
pub mod steps;
pub mod telemetry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::TaskLogger;
pub use metrics::{MetricsCollector, StepTimer};
pub use pipeline::{
    config_fingerprint, CheckpointPolicy, CheckpointWriter, FailurePolicy, PipelineRunner,
    PipelineRunnerBuilder, ResourceProbe, RunnerOptions, TaskReport,
};
pub use shutdown::ShutdownController;
pub use steps::register_builtin_steps;
