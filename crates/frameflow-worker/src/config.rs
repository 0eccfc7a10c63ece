//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use frameflow_media::PoolConfig;

use crate::pipeline::{CheckpointPolicy, FailurePolicy, RunnerOptions};

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Threads in the frame worker pool
    pub worker_threads: usize,
    /// Maximum frames of one task in flight at once
    pub frame_parallelism: usize,
    /// Directory holding checkpoint files
    pub checkpoint_dir: PathBuf,
    /// Save a checkpoint every N completed frames (0 disables)
    pub checkpoint_every_frames: u64,
    /// Save a checkpoint at least this often while frames complete
    pub checkpoint_interval: Option<Duration>,
    /// Grace period between a shutdown request and a forced exit
    pub shutdown_timeout: Duration,
    /// Cache inference sessions between steps and tasks
    pub session_cache_enabled: bool,
    /// Idle time before a cached session expires
    pub session_idle_timeout: Duration,
    /// Soft limit of cached sessions (0 = unbounded)
    pub session_max_entries: usize,
    /// Minimum spacing of GPU memory samples
    pub gpu_sample_interval: Duration,
    /// Failed-frame ratio that aborts a task
    pub max_failure_ratio: f64,
    /// Frames seen before the failure ratio is enforced
    pub min_frames_for_failure_ratio: u64,
    /// Root directory of model files
    pub model_dir: PathBuf,
    /// Optional JSON model manifest
    pub model_manifest: Option<PathBuf>,
    /// Task document to run (binary only)
    pub task_file: Option<PathBuf>,
    /// Directory of raw input frames (binary only)
    pub input_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let threads = default_threads();
        Self {
            worker_threads: threads,
            frame_parallelism: threads * 2,
            checkpoint_dir: PathBuf::from("/tmp/frameflow/checkpoints"),
            checkpoint_every_frames: 50,
            checkpoint_interval: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(30),
            session_cache_enabled: true,
            session_idle_timeout: Duration::from_secs(300), // 5 minutes
            session_max_entries: 8,
            gpu_sample_interval: Duration::from_millis(100),
            max_failure_ratio: 0.1,
            min_frames_for_failure_ratio: 20,
            model_dir: PathBuf::from("models"),
            model_manifest: None,
            task_file: None,
            input_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let worker_threads = env_or("FRAMEFLOW_WORKER_THREADS", defaults.worker_threads).max(1);

        Self {
            worker_threads,
            frame_parallelism: env_or("FRAMEFLOW_FRAME_PARALLELISM", worker_threads * 2).max(1),
            checkpoint_dir: std::env::var("FRAMEFLOW_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_dir),
            checkpoint_every_frames: env_or(
                "FRAMEFLOW_CHECKPOINT_EVERY_FRAMES",
                defaults.checkpoint_every_frames,
            ),
            checkpoint_interval: match env_or("FRAMEFLOW_CHECKPOINT_INTERVAL_SECS", 30u64) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            shutdown_timeout: Duration::from_secs(env_or("FRAMEFLOW_SHUTDOWN_TIMEOUT_SECS", 30)),
            session_cache_enabled: env_flag("FRAMEFLOW_SESSION_CACHE", true),
            session_idle_timeout: Duration::from_secs(env_or(
                "FRAMEFLOW_SESSION_IDLE_TIMEOUT_SECS",
                300,
            )),
            session_max_entries: env_or("FRAMEFLOW_SESSION_MAX_ENTRIES", defaults.session_max_entries),
            gpu_sample_interval: Duration::from_millis(env_or(
                "FRAMEFLOW_GPU_SAMPLE_INTERVAL_MS",
                100,
            )),
            max_failure_ratio: env_or("FRAMEFLOW_MAX_FAILURE_RATIO", defaults.max_failure_ratio),
            min_frames_for_failure_ratio: env_or(
                "FRAMEFLOW_MIN_FRAMES_FOR_FAILURE_RATIO",
                defaults.min_frames_for_failure_ratio,
            ),
            model_dir: std::env::var("FRAMEFLOW_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            model_manifest: std::env::var("FRAMEFLOW_MODEL_MANIFEST").ok().map(PathBuf::from),
            task_file: std::env::var("FRAMEFLOW_TASK_FILE").ok().map(PathBuf::from),
            input_dir: std::env::var("FRAMEFLOW_INPUT_DIR").ok().map(PathBuf::from),
        }
    }

    /// Session pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            enabled: self.session_cache_enabled,
            max_entries: self.session_max_entries,
            idle_timeout: self.session_idle_timeout,
            ..PoolConfig::default()
        }
    }

    /// Pipeline runner settings.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            frame_parallelism: self.frame_parallelism,
            checkpoint_policy: CheckpointPolicy {
                every_frames: self.checkpoint_every_frames,
                interval: self.checkpoint_interval,
            },
            failure_policy: FailurePolicy {
                max_failure_ratio: self.max_failure_ratio,
                min_frames: self.min_frames_for_failure_ratio,
            },
            gpu_sample_interval: self.gpu_sample_interval,
        }
    }
}
