//! Per-task metrics collection.
//!
//! Counts frames, times processing steps and samples accelerator memory for
//! one task run, and renders the result as a JSON report.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use frameflow_models::{
    FrameSummary, GpuMemorySample, MetricsSnapshot, ResourceUsage, StepLatency, TaskId,
    METRICS_SCHEMA_VERSION,
};
use tracing::{debug, warn};

/// Placeholder replaced by the export time in metrics export paths.
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

#[derive(Default)]
struct CollectorState {
    total_frames: u64,
    processed_frames: u64,
    failed_frames: u64,
    skipped_frames: u64,
    step_starts: HashMap<(String, ThreadId), Instant>,
    /// Step durations in milliseconds
    step_samples: BTreeMap<String, Vec<f64>>,
    gpu_peak_mb: u64,
    gpu_total_mb: u128,
    gpu_samples: Vec<GpuMemorySample>,
    last_gpu_sample: Option<Instant>,
    gpu_sample_interval: Duration,
}

/// Thread-safe metrics of a single task run.
pub struct MetricsCollector {
    task_id: TaskId,
    started: Instant,
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            started: Instant::now(),
            state: Mutex::new(CollectorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn set_total_frames(&self, total: u64) {
        self.lock().total_frames = total;
    }

    pub fn record_frame_completed(&self) {
        self.lock().processed_frames += 1;
    }

    pub fn record_frame_failed(&self) {
        self.lock().failed_frames += 1;
    }

    /// Frames not processed because an earlier run already did.
    pub fn record_frames_skipped(&self, count: u64) {
        self.lock().skipped_frames += count;
    }

    /// Start timing `step` on the calling thread.
    pub fn start_step(&self, step: &str) {
        self.lock()
            .step_starts
            .insert((step.to_string(), thread::current().id()), Instant::now());
    }

    /// Stop timing `step` on the calling thread and record the sample.
    pub fn end_step(&self, step: &str) {
        let mut state = self.lock();
        match state
            .step_starts
            .remove(&(step.to_string(), thread::current().id()))
        {
            Some(started) => {
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                state.step_samples.entry(step.to_string()).or_default().push(ms);
            }
            None => debug!(step, "end_step without matching start_step"),
        }
    }

    /// Time `step` until the returned guard is dropped.
    pub fn time_step(&self, step: &str) -> StepTimer<'_> {
        StepTimer {
            collector: self,
            step: step.to_string(),
            started: Instant::now(),
        }
    }

    pub fn record_step_duration(&self, step: &str, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.lock()
            .step_samples
            .entry(step.to_string())
            .or_default()
            .push(ms);
    }

    /// Minimum spacing of accepted GPU memory samples.
    pub fn set_gpu_sample_interval(&self, interval: Duration) {
        self.lock().gpu_sample_interval = interval;
    }

    /// Record accelerator memory usage. Returns false if the sample was
    /// dropped for arriving within the sample interval of the previous one.
    pub fn record_gpu_memory(&self, usage_mb: u64) -> bool {
        let mut state = self.lock();
        let now = Instant::now();

        if let Some(last) = state.last_gpu_sample {
            if now.duration_since(last) < state.gpu_sample_interval {
                return false;
            }
        }

        state.last_gpu_sample = Some(now);
        state.gpu_peak_mb = state.gpu_peak_mb.max(usage_mb);
        state.gpu_total_mb += u128::from(usage_mb);
        state.gpu_samples.push(GpuMemorySample {
            timestamp_ms: now.duration_since(self.started).as_millis() as u64,
            usage_mb,
        });
        true
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let state = self.lock();

        let step_latency = state
            .step_samples
            .iter()
            .map(|(name, samples)| latency_stats(name, samples))
            .collect();

        let avg_gpu_memory_mb = if state.gpu_samples.is_empty() {
            0.0
        } else {
            state.gpu_total_mb as f64 / state.gpu_samples.len() as f64
        };

        MetricsSnapshot {
            schema_version: METRICS_SCHEMA_VERSION,
            task_id: self.task_id.clone(),
            timestamp: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            summary: FrameSummary {
                total_frames: state.total_frames,
                processed_frames: state.processed_frames,
                failed_frames: state.failed_frames,
                skipped_frames: state.skipped_frames,
            },
            step_latency,
            resource_usage: ResourceUsage {
                peak_gpu_memory_mb: state.gpu_peak_mb,
                avg_gpu_memory_mb,
                samples: state.gpu_samples.clone(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.get_metrics())
    }

    /// Write the JSON report to `path`, creating parent directories.
    ///
    /// A `{timestamp}` in the path is replaced by the export time. Returns
    /// false (after logging) if the report could not be written.
    pub fn export_json(&self, path: &Path) -> bool {
        let path = resolve_export_path(path, Utc::now());

        let json = match self.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Failed to serialize metrics");
                return false;
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Failed to create metrics directory");
                return false;
            }
        }

        match std::fs::write(&path, json) {
            Ok(()) => {
                debug!(task_id = %self.task_id, path = %path.display(), "Exported metrics");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write metrics");
                false
            }
        }
    }
}

/// Guard returned by [`MetricsCollector::time_step`].
pub struct StepTimer<'a> {
    collector: &'a MetricsCollector,
    step: String,
    started: Instant,
}

impl Drop for StepTimer<'_> {
    fn drop(&mut self) {
        self.collector
            .record_step_duration(&self.step, self.started.elapsed());
    }
}

/// Substitute the export time for `{timestamp}` (filesystem-safe RFC 3339).
pub fn resolve_export_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let raw = path.to_string_lossy();
    if !raw.contains(TIMESTAMP_PLACEHOLDER) {
        return path.to_path_buf();
    }
    let stamp = now.format("%Y-%m-%dT%H-%M-%SZ").to_string();
    PathBuf::from(raw.replace(TIMESTAMP_PLACEHOLDER, &stamp))
}

/// Nearest-rank percentile of sorted samples (`rank = ceil(p * n)`).
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn latency_stats(name: &str, samples: &[f64]) -> StepLatency {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let total_ms: f64 = sorted.iter().sum();
    let count = sorted.len() as u64;

    StepLatency {
        step_name: name.to_string(),
        count,
        mean_ms: if count == 0 { 0.0 } else { total_ms / count as f64 },
        p50_ms: percentile(&sorted, 0.50),
        p99_ms: percentile(&sorted, 0.99),
        total_ms,
    }
}
