//! Task runner: drives frames through the configured steps with checkpointed
//! resume and cooperative shutdown.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use frameflow_media::{
    collect_step_state, default_backend, Frame, FrameSink, FrameSource, InferenceSessionPool,
    LocalModelProvider, MediaError, ModelProvider, PoolConfig, ProcessingStep, SessionBackend,
    SessionPool, StepContext, StepRegistry,
};
use frameflow_models::{CheckpointRecord, MetricsSnapshot, TaskConfig, TaskId, TaskState};
use frameflow_queue::{TaskHandle, WorkerPool};
use frameflow_storage::CheckpointStore;

use super::checkpoint_policy::{CheckpointPolicy, CheckpointWriter};
use super::fingerprint::config_fingerprint;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;
use crate::metrics::MetricsCollector;
use crate::shutdown::ShutdownController;
use crate::telemetry;

/// Abort a task once too many of its frames failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailurePolicy {
    pub max_failure_ratio: f64,
    /// Frames seen before the ratio is enforced
    pub min_frames: u64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failure_ratio: 0.1,
            min_frames: 20,
        }
    }
}

impl FailurePolicy {
    pub fn exceeded(&self, failed: u64, seen: u64) -> bool {
        seen > 0 && seen >= self.min_frames && failed as f64 / seen as f64 > self.max_failure_ratio
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Frames of one task in flight at once
    pub frame_parallelism: usize,
    pub checkpoint_policy: CheckpointPolicy,
    pub failure_policy: FailurePolicy,
    pub gpu_sample_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            frame_parallelism: 4,
            checkpoint_policy: CheckpointPolicy::default(),
            failure_policy: FailurePolicy::default(),
            gpu_sample_interval: Duration::from_millis(100),
        }
    }
}

/// Source of accelerator memory readings, sampled after every frame.
pub trait ResourceProbe: Send + Sync {
    fn gpu_memory_mb(&self) -> Option<u64>;
}

/// Outcome of one [`PipelineRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub state: TaskState,
    /// First frame processed by this run when it picked up a checkpoint
    pub resumed_from: Option<u64>,
    pub last_completed_frame: Option<u64>,
    pub error: Option<String>,
    pub metrics: MetricsSnapshot,
}

impl TaskReport {
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            TaskState::Completed => 0,
            TaskState::Interrupted => 130,
            _ => 1,
        }
    }
}

type StepList = Arc<Vec<Box<dyn ProcessingStep>>>;

struct FrameOutcome {
    /// Processed frame, or the original when a step failed
    frame: Frame,
    error: Option<MediaError>,
}

enum Pending {
    Queued(TaskHandle<FrameOutcome>),
    Done(Result<FrameOutcome, String>),
}

impl Pending {
    fn wait(self) -> Result<FrameOutcome, String> {
        match self {
            Pending::Queued(handle) => handle.join().map_err(|e| e.to_string()),
            Pending::Done(result) => result,
        }
    }
}

struct LoopResult {
    last_completed: Option<u64>,
    interrupted: bool,
    fatal: Option<String>,
}

/// Runs tasks against a shared set of sessions, models and workers.
pub struct PipelineRunner {
    // Declaration order is drop order.
    registry: Arc<StepRegistry>,
    models: Arc<dyn ModelProvider>,
    sessions: Arc<InferenceSessionPool>,
    checkpoints: CheckpointStore,
    backend: Arc<dyn SessionBackend>,
    shutdown: ShutdownController,
    workers: Arc<WorkerPool>,
    options: RunnerOptions,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl PipelineRunner {
    pub fn builder(checkpoints: CheckpointStore) -> PipelineRunnerBuilder {
        PipelineRunnerBuilder::new(checkpoints)
    }

    /// Runner wired from worker configuration.
    pub fn from_config(
        config: &WorkerConfig,
        registry: Arc<StepRegistry>,
        shutdown: ShutdownController,
    ) -> WorkerResult<Self> {
        let models: Arc<dyn ModelProvider> = match &config.model_manifest {
            Some(manifest) => Arc::new(LocalModelProvider::from_manifest_file(
                &config.model_dir,
                manifest,
            )?),
            None => Arc::new(LocalModelProvider::new(&config.model_dir)),
        };

        PipelineRunner::builder(CheckpointStore::new(&config.checkpoint_dir)?)
            .registry(registry)
            .models(models)
            .pool_config(config.pool_config())
            .workers(Arc::new(WorkerPool::with_size(config.worker_threads)?))
            .shutdown(shutdown)
            .options(config.runner_options())
            .build()
    }

    pub fn sessions(&self) -> &Arc<InferenceSessionPool> {
        &self.sessions
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn shutdown(&self) -> &ShutdownController {
        &self.shutdown
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Run one task from `source` into `sink`.
    ///
    /// Returns `Err` only when the task cannot start (unknown step, missing
    /// model, step load failure, no enabled steps). Everything after that is
    /// reported through [`TaskReport::state`].
    pub fn run(
        &self,
        task: &TaskConfig,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
    ) -> WorkerResult<TaskReport> {
        let logger = TaskLogger::new(&task.task_id, "pipeline");
        let span = logger.create_span();
        let _enter = span.enter();

        let metrics = Arc::new(MetricsCollector::new(task.task_id.clone()));
        metrics.set_gpu_sample_interval(self.options.gpu_sample_interval);

        let (steps, fingerprint) = match self.prepare(task) {
            Ok(prepared) => prepared,
            Err(e) => {
                logger.log_error(&e.to_string());
                telemetry::record_task_finished(TaskState::Failed);
                return Err(e);
            }
        };
        logger.log_start(&format!(
            "{} steps, resume {}",
            steps.len(),
            if task.enable_resume { "enabled" } else { "disabled" }
        ));

        let total_frames = source.total_frames();
        if let Some(total) = total_frames {
            metrics.set_total_frames(total);
        }

        let mut resumed = if task.enable_resume {
            self.checkpoints.load(&task.task_id, &fingerprint)
        } else {
            None
        };
        let mut start_frame = resumed.as_ref().map_or(0, CheckpointRecord::resume_frame);
        let mut started = self.start(source, sink, start_frame, &metrics);
        let resume_error = match (&started, &resumed) {
            (Err(e), Some(_)) => Some(e.to_string()),
            _ => None,
        };
        if let Some(reason) = resume_error {
            logger.log_warning(&format!(
                "cannot resume at frame {} ({}), restarting from frame 0",
                start_frame, reason
            ));
            if let Err(e) = self.checkpoints.cleanup(&task.task_id) {
                logger.log_warning(&format!("failed to remove checkpoint: {}", e));
            }
            resumed = None;
            start_frame = 0;
            started = self.start(source, sink, 0, &metrics);
        }
        if resumed.is_some() && started.is_ok() {
            logger.log_progress(&format!("resuming at frame {}", start_frame));
        }
        let created_at = resumed.as_ref().map(|record| record.created_at);

        let writer = CheckpointWriter::new(
            &self.checkpoints,
            self.options.checkpoint_policy,
            task.enable_resume,
        );
        let make_record = |frame: u64, sink: &dyn FrameSink| {
            let mut record = CheckpointRecord::new(
                task.task_id.clone(),
                fingerprint.clone(),
                frame,
                task.output_path.clone(),
            )
            .with_total_frames(total_frames.unwrap_or(0))
            .with_output_size(sink.bytes_written());
            record.step_state = collect_step_state(&steps);
            if let Some(created_at) = created_at {
                record.created_at = created_at;
            }
            record
        };

        let result = match started {
            Ok(()) => self.process_frames(
                task,
                source,
                sink,
                &steps,
                &metrics,
                &writer,
                start_frame,
                &make_record,
            ),
            Err(e) => LoopResult {
                last_completed: None,
                interrupted: false,
                fatal: Some(e.to_string()),
            },
        };

        let mut fatal = result.fatal;
        let state = if fatal.is_some() {
            TaskState::Failed
        } else if result.interrupted {
            TaskState::Interrupted
        } else {
            match sink.finish() {
                Ok(bytes) => {
                    debug!(bytes, "Output finished");
                    TaskState::Completed
                }
                Err(e) => {
                    fatal = Some(format!("finishing output: {}", e));
                    TaskState::Failed
                }
            }
        };

        match state {
            TaskState::Completed => {
                if task.enable_resume {
                    if let Err(e) = self.checkpoints.cleanup(&task.task_id) {
                        logger.log_warning(&format!("failed to remove checkpoint: {}", e));
                    }
                }
            }
            _ => {
                if let Some(frame) = result.last_completed {
                    writer.save_now(make_record(frame, &*sink));
                }
            }
        }
        drop(steps);

        if let Some(path) = &task.metrics_path {
            metrics.export_json(path);
        }
        telemetry::record_task_finished(state);
        if let Err(e) = self.sessions.schedule_cleanup(&self.workers) {
            debug!(error = %e, "Session cleanup not scheduled");
        }

        let snapshot = metrics.get_metrics();
        let summary = format!(
            "{} ({} processed, {} failed, {} skipped)",
            state,
            snapshot.summary.processed_frames,
            snapshot.summary.failed_frames,
            snapshot.summary.skipped_frames
        );
        match &fatal {
            Some(error) => logger.log_error(&format!("{}: {}", summary, error)),
            None => logger.log_completion(&summary),
        }

        Ok(TaskReport {
            task_id: task.task_id.clone(),
            state,
            resumed_from: resumed.map(|_| start_frame),
            last_completed_frame: result.last_completed,
            error: fatal,
            metrics: snapshot,
        })
    }

    /// Build and load the steps, and fingerprint the configuration.
    fn prepare(&self, task: &TaskConfig) -> WorkerResult<(StepList, String)> {
        let mut steps = Vec::new();
        for config in task.enabled_steps() {
            let ctx = StepContext {
                config: config.clone(),
                execution: task.execution.clone(),
                sessions: Arc::clone(&self.sessions),
                models: Arc::clone(&self.models),
                backend: Arc::clone(&self.backend),
            };
            let mut step = self.registry.create(&config.step, &ctx)?;
            step.ensure_loaded()?;
            steps.push(step);
        }

        if steps.is_empty() {
            return Err(WorkerError::config_error(format!(
                "task {} has no enabled steps",
                task.task_id
            )));
        }

        let fingerprint = config_fingerprint(task)?;
        Ok((Arc::new(steps), fingerprint))
    }

    fn start(
        &self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        start_frame: u64,
        metrics: &MetricsCollector,
    ) -> WorkerResult<()> {
        if start_frame > 0 {
            source.seek(start_frame)?;
        }
        sink.begin(start_frame)?;
        if start_frame > 0 {
            metrics.record_frames_skipped(start_frame);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_frames(
        &self,
        task: &TaskConfig,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        steps: &StepList,
        metrics: &Arc<MetricsCollector>,
        writer: &CheckpointWriter<'_>,
        start_frame: u64,
        make_record: &dyn Fn(u64, &dyn FrameSink) -> CheckpointRecord,
    ) -> LoopResult {
        let window = self.options.frame_parallelism.max(1);
        let inline = WorkerPool::is_worker_thread();
        if inline {
            debug!("Running frames inline on a pool worker");
        }

        let mut in_flight: VecDeque<Pending> = VecDeque::with_capacity(window);
        let mut last_completed = start_frame.checked_sub(1);
        let mut exhausted = false;
        let mut interrupted = false;
        let mut fatal: Option<String> = None;
        let mut seen = 0u64;
        let mut failed = 0u64;

        loop {
            while fatal.is_none() && !exhausted && !interrupted && in_flight.len() < window {
                if self.shutdown.is_shutdown_requested() {
                    info!(task_id = %task.task_id, "Shutdown requested, draining in-flight frames");
                    interrupted = true;
                    break;
                }
                match source.next_frame() {
                    Ok(Some(frame)) => match self.dispatch(inline, steps, metrics, frame) {
                        Ok(pending) => in_flight.push_back(pending),
                        Err(e) => fatal = Some(e.to_string()),
                    },
                    Ok(None) => exhausted = true,
                    Err(e) => fatal = Some(format!("reading frame: {}", e)),
                }
            }

            let Some(pending) = in_flight.pop_front() else {
                break;
            };
            let outcome = match pending.wait() {
                Ok(outcome) => outcome,
                Err(message) => {
                    fatal.get_or_insert(message);
                    continue;
                }
            };
            if fatal.is_some() {
                // Draining after a fatal error: results are discarded.
                continue;
            }

            let index = outcome.frame.index;
            seen += 1;
            match outcome.error {
                None => {
                    metrics.record_frame_completed();
                    telemetry::record_frame_processed();
                }
                Some(e) if e.is_frame_local() => {
                    failed += 1;
                    metrics.record_frame_failed();
                    telemetry::record_frame_failed();
                    warn!(frame = index, error = %e, "Frame failed, writing it unprocessed");
                }
                Some(e) => {
                    fatal = Some(format!("frame {}: {}", index, e));
                    continue;
                }
            }

            if let Err(e) = sink.write_frame(&outcome.frame) {
                fatal = Some(format!("writing frame {}: {}", index, e));
                continue;
            }
            last_completed = Some(index);

            let policy = self.options.failure_policy;
            if policy.exceeded(failed, seen) {
                fatal = Some(
                    WorkerError::FailureThresholdExceeded {
                        failed,
                        seen,
                        max_ratio: policy.max_failure_ratio,
                    }
                    .to_string(),
                );
                continue;
            }

            if let Some(mb) = self.probe.as_ref().and_then(|probe| probe.gpu_memory_mb()) {
                metrics.record_gpu_memory(mb);
            }

            let sink_view: &dyn FrameSink = &*sink;
            writer.frame_completed(index, || make_record(index, sink_view));
        }

        LoopResult {
            last_completed,
            interrupted,
            fatal,
        }
    }

    fn dispatch(
        &self,
        inline: bool,
        steps: &StepList,
        metrics: &Arc<MetricsCollector>,
        frame: Frame,
    ) -> WorkerResult<Pending> {
        if inline {
            let outcome = catch_unwind(AssertUnwindSafe(|| process_frame(steps, metrics, frame)))
                .map_err(|_| "processing step panicked".to_string());
            return Ok(Pending::Done(outcome));
        }

        let steps = Arc::clone(steps);
        let metrics = Arc::clone(metrics);
        let handle = self
            .workers
            .submit(move || process_frame(&steps, &metrics, frame))?;
        Ok(Pending::Queued(handle))
    }
}

/// Run every step over a frame. On failure the original frame is returned
/// with the error.
fn process_frame(
    steps: &[Box<dyn ProcessingStep>],
    metrics: &MetricsCollector,
    frame: Frame,
) -> FrameOutcome {
    let mut working = frame.clone();
    for step in steps {
        let started = Instant::now();
        let result = step.process(&mut working);
        let elapsed = started.elapsed();
        metrics.record_step_duration(step.name(), elapsed);
        telemetry::record_step_duration(step.name(), elapsed);

        if let Err(error) = result {
            return FrameOutcome {
                frame,
                error: Some(error),
            };
        }
    }
    FrameOutcome {
        frame: working,
        error: None,
    }
}

/// Builder for [`PipelineRunner`].
pub struct PipelineRunnerBuilder {
    checkpoints: CheckpointStore,
    registry: Option<Arc<StepRegistry>>,
    models: Option<Arc<dyn ModelProvider>>,
    backend: Option<Arc<dyn SessionBackend>>,
    sessions: Option<Arc<InferenceSessionPool>>,
    pool_config: PoolConfig,
    shutdown: Option<ShutdownController>,
    workers: Option<Arc<WorkerPool>>,
    options: RunnerOptions,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl PipelineRunnerBuilder {
    fn new(checkpoints: CheckpointStore) -> Self {
        Self {
            checkpoints,
            registry: None,
            models: None,
            backend: None,
            sessions: None,
            pool_config: PoolConfig::default(),
            shutdown: None,
            workers: None,
            options: RunnerOptions::default(),
            probe: None,
        }
    }

    pub fn registry(mut self, registry: Arc<StepRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn models(mut self, models: Arc<dyn ModelProvider>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Share an existing session pool (takes precedence over `pool_config`).
    pub fn sessions(mut self, sessions: Arc<InferenceSessionPool>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownController) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> WorkerResult<PipelineRunner> {
        let workers = match self.workers {
            Some(workers) => workers,
            None => {
                let threads = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                Arc::new(WorkerPool::with_size(threads)?)
            }
        };

        Ok(PipelineRunner {
            registry: self.registry.unwrap_or_default(),
            models: self
                .models
                .unwrap_or_else(|| Arc::new(LocalModelProvider::new("models"))),
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(SessionPool::new(self.pool_config))),
            checkpoints: self.checkpoints,
            backend: self.backend.unwrap_or_else(default_backend),
            shutdown: self.shutdown.unwrap_or_default(),
            workers,
            options: self.options,
            probe: self.probe,
        })
    }
}
