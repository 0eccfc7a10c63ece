//! Task execution pipeline.
//!
//! - `fingerprint`: configuration fingerprint matching checkpoints to tasks
//! - `checkpoint_policy`: checkpoint cadence and monotonic writer
//! - `runner`: the frame loop with resume, failure accounting and shutdown

mod checkpoint_policy;
mod fingerprint;
mod runner;

pub use checkpoint_policy::{CheckpointPolicy, CheckpointWriter};
pub use fingerprint::config_fingerprint;
pub use runner::{
    FailurePolicy, PipelineRunner, PipelineRunnerBuilder, ResourceProbe, RunnerOptions, TaskReport,
};
