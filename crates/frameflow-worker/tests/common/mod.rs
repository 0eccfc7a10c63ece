//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use frameflow_media::{Frame, MediaError, MediaResult, ProcessingStep, StepContext, StepRegistry};
use frameflow_queue::WorkerPool;
use frameflow_storage::CheckpointStore;
use frameflow_worker::{
    register_builtin_steps, CheckpointPolicy, FailurePolicy, PipelineRunner, RunnerOptions,
    ShutdownController,
};
use tempfile::TempDir;

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 4;
pub const CHANNELS: u8 = 3;

pub fn options(frame_parallelism: usize) -> RunnerOptions {
    RunnerOptions {
        frame_parallelism,
        checkpoint_policy: CheckpointPolicy {
            every_frames: 10,
            interval: None,
        },
        failure_policy: FailurePolicy {
            max_failure_ratio: 0.5,
            min_frames: 10,
        },
        ..RunnerOptions::default()
    }
}

pub fn runner(
    checkpoints: &TempDir,
    registry: Arc<StepRegistry>,
    shutdown: ShutdownController,
    options: RunnerOptions,
) -> PipelineRunner {
    PipelineRunner::builder(
        CheckpointStore::new(checkpoints.path()).expect("Failed to open checkpoint store"),
    )
    .registry(registry)
    .shutdown(shutdown)
    .workers(Arc::new(WorkerPool::with_size(2).expect("Failed to start workers")))
    .options(options)
    .build()
    .expect("Failed to build runner")
}

/// Registry with the built-in steps plus the test steps below.
pub fn registry(shutdown: &ShutdownController) -> Arc<StepRegistry> {
    let registry = Arc::new(StepRegistry::new());
    register_builtin_steps(&registry);

    let controller = shutdown.clone();
    registry.register("shutdown_at", move |ctx: &StepContext| {
        let frame = ctx.param::<u64>("frame")?.unwrap_or(0);
        Ok(Box::new(ShutdownAt {
            controller: controller.clone(),
            frame,
        }) as Box<dyn ProcessingStep>)
    });
    registry.register("fail_frames", |ctx: &StepContext| {
        let frames: Vec<u64> = ctx.param("frames")?.unwrap_or_default();
        let fatal = ctx.param::<bool>("fatal")?.unwrap_or(false);
        Ok(Box::new(FailFrames {
            frames: frames.into_iter().collect(),
            fatal,
        }) as Box<dyn ProcessingStep>)
    });
    registry.register("fail_to_load", |_ctx: &StepContext| {
        Ok(Box::new(FailToLoad) as Box<dyn ProcessingStep>)
    });
    registry
}

/// Requests shutdown while processing one frame.
struct ShutdownAt {
    controller: ShutdownController,
    frame: u64,
}

impl ProcessingStep for ShutdownAt {
    fn name(&self) -> &str {
        "shutdown_at"
    }

    fn process(&self, frame: &mut Frame) -> MediaResult<()> {
        if frame.index == self.frame {
            self.controller.request_shutdown();
        }
        Ok(())
    }
}

/// Fails the listed frames, with a frame-local or a fatal error.
struct FailFrames {
    frames: HashSet<u64>,
    fatal: bool,
}

impl ProcessingStep for FailFrames {
    fn name(&self) -> &str {
        "fail_frames"
    }

    fn process(&self, frame: &mut Frame) -> MediaResult<()> {
        if !self.frames.contains(&frame.index) {
            return Ok(());
        }
        // Scribble first so a passed-through frame is distinguishable.
        frame.data.fill(7);
        if self.fatal {
            Err(MediaError::internal(format!("device lost at frame {}", frame.index)))
        } else {
            Err(MediaError::inference(format!("bad output at frame {}", frame.index)))
        }
    }
}

struct FailToLoad;

impl ProcessingStep for FailToLoad {
    fn name(&self) -> &str {
        "fail_to_load"
    }

    fn ensure_loaded(&mut self) -> MediaResult<()> {
        Err(MediaError::model_not_found("weights.onnx"))
    }

    fn process(&self, _frame: &mut Frame) -> MediaResult<()> {
        Ok(())
    }
}

/// Inverted value of a synthetic frame.
pub fn inverted(index: u64) -> u8 {
    255 - (index % 256) as u8
}
