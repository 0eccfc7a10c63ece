//! Prometheus metrics for the worker process.
//!
//! These aggregate across tasks; the per-task JSON report comes from
//! [`MetricsCollector`](crate::metrics::MetricsCollector).

use std::time::Duration;

use frameflow_models::TaskState;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const FRAMES_PROCESSED_TOTAL: &str = "frameflow_frames_processed_total";
    pub const FRAMES_FAILED_TOTAL: &str = "frameflow_frames_failed_total";
    pub const STEP_DURATION_SECONDS: &str = "frameflow_step_duration_seconds";
    pub const TASKS_TOTAL: &str = "frameflow_tasks_total";
    pub const CHECKPOINT_WRITES_TOTAL: &str = "frameflow_checkpoint_writes_total";
}

pub fn record_frame_processed() {
    counter!(names::FRAMES_PROCESSED_TOTAL).increment(1);
}

pub fn record_frame_failed() {
    counter!(names::FRAMES_FAILED_TOTAL).increment(1);
}

pub fn record_step_duration(step: &str, duration: Duration) {
    let labels = [("step", step.to_string())];
    histogram!(names::STEP_DURATION_SECONDS, &labels).record(duration.as_secs_f64());
}

pub fn record_task_finished(state: TaskState) {
    let labels = [("state", state.as_str().to_string())];
    counter!(names::TASKS_TOTAL, &labels).increment(1);
}

pub fn record_checkpoint_write(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!(names::CHECKPOINT_WRITES_TOTAL, "result" => result).increment(1);
}
