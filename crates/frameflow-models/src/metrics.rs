//! Per-task metrics report.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Version of the JSON metrics report layout.
pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// Frame counters of a task run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FrameSummary {
    pub total_frames: u64,
    pub processed_frames: u64,
    pub failed_frames: u64,
    /// Frames skipped because a checkpoint was resumed
    pub skipped_frames: u64,
}

/// Latency statistics of one processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepLatency {
    pub step_name: String,
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub total_ms: f64,
}

/// A single accepted GPU memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GpuMemorySample {
    /// Milliseconds since the collector was created
    pub timestamp_ms: u64,
    pub usage_mb: u64,
}

/// Accelerator memory usage over the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceUsage {
    pub peak_gpu_memory_mb: u64,
    pub avg_gpu_memory_mb: f64,
    pub samples: Vec<GpuMemorySample>,
}

/// Point-in-time view of a task's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricsSnapshot {
    pub schema_version: u32,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    /// Wall time since the collector was created
    pub duration_ms: u64,
    pub summary: FrameSummary,
    /// One entry per step, sorted by step name
    pub step_latency: Vec<StepLatency>,
    pub resource_usage: ResourceUsage,
}

impl MetricsSnapshot {
    pub fn step(&self, name: &str) -> Option<&StepLatency> {
        self.step_latency.iter().find(|s| s.step_name == name)
    }
}
