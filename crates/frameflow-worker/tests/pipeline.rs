//! Pipeline runner integration tests.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use frameflow_media::{MemoryFrameSink, MemoryFrameSource};
use frameflow_models::{CheckpointRecord, StepConfig, TaskConfig, TaskState};
use frameflow_storage::CheckpointStore;
use frameflow_worker::{ResourceProbe, ShutdownController, WorkerError};
use serde_json::json;
use tempfile::TempDir;

use common::{inverted, CHANNELS, HEIGHT, WIDTH};

fn source(frames: u64) -> MemoryFrameSource {
    MemoryFrameSource::synthetic(frames, WIDTH, HEIGHT, CHANNELS)
}

/// Frames come out in order even when processed in parallel.
#[test]
fn test_parallel_run_preserves_order() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(8),
    );
    let task = TaskConfig::new("ordered", "/tmp/out")
        .with_step(StepConfig::new("passthrough"))
        .with_step(StepConfig::new("invert"))
        .with_resume(true);

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(300), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.last_completed_frame, Some(299));
    let indices: Vec<u64> = sink.frames().iter().map(|f| f.index).collect();
    assert_eq!(indices, (0..300).collect::<Vec<_>>());
    assert!(sink.frames().iter().all(|f| f.data[0] == inverted(f.index)));

    let snapshot = &report.metrics;
    assert_eq!(snapshot.summary.total_frames, 300);
    assert_eq!(snapshot.summary.processed_frames, 300);
    assert_eq!(snapshot.step("invert").unwrap().count, 300);
    assert_eq!(snapshot.step("passthrough").unwrap().count, 300);
    assert!(!runner.checkpoints().exists(&task.task_id));
}

/// A frame-local failure writes the original frame and the task completes.
#[test]
fn test_frame_local_failure_passes_frame_through() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(4),
    );
    let task = TaskConfig::new("flaky", "/tmp/out")
        .with_step(StepConfig::new("fail_frames").with_param("frames", json!([3, 17])))
        .with_step(StepConfig::new("invert"));

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(40), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(report.metrics.summary.failed_frames, 2);
    assert_eq!(report.metrics.summary.processed_frames, 38);
    assert_eq!(sink.frames().len(), 40);

    // Original, unprocessed content.
    assert!(sink.frames()[3].data.iter().all(|&v| v == 3));
    assert!(sink.frames()[17].data.iter().all(|&v| v == 17));
    assert!(sink.frames()[4].data.iter().all(|&v| v == inverted(4)));
}

/// Too many failed frames abort the task and keep its checkpoint.
#[test]
fn test_failure_ratio_aborts_task() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(1),
    );
    let failing: Vec<u64> = (0..100).filter(|i| i % 4 != 0).collect();
    let task = TaskConfig::new("doomed", "/tmp/out")
        .with_step(StepConfig::new("fail_frames").with_param("frames", json!(failing)))
        .with_resume(true);

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(100), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(report.error.as_deref().unwrap().contains("Too many failed frames"));
    // Enforcement starts at the tenth frame.
    assert_eq!(report.last_completed_frame, Some(9));
    assert!(!sink.is_finished());

    let record = runner.checkpoints().read(&task.task_id).unwrap().unwrap();
    assert_eq!(record.last_completed_frame, 9);
}

/// A fatal step error stops the task after the last good frame.
#[test]
fn test_fatal_error_stops_task() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(4),
    );
    let task = TaskConfig::new("fatal", "/tmp/out")
        .with_step(
            StepConfig::new("fail_frames")
                .with_param("frames", json!([30]))
                .with_param("fatal", json!(true)),
        )
        .with_resume(true);

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(100), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.last_completed_frame, Some(29));
    assert!(report.error.as_deref().unwrap().contains("device lost"));
    assert_eq!(sink.frames().len(), 30);

    let record = runner.checkpoints().read(&task.task_id).unwrap().unwrap();
    assert_eq!(record.last_completed_frame, 29);
}

/// Start-up problems are returned as errors, not reports.
#[test]
fn test_configuration_errors_fail_to_start() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(2),
    );
    let mut sink = MemoryFrameSink::new();

    let unknown = TaskConfig::new("unknown", "/tmp/out").with_step(StepConfig::new("blur"));
    let err = runner.run(&unknown, &mut source(5), &mut sink).unwrap_err();
    assert!(err.is_config_error());

    let empty = TaskConfig::new("empty", "/tmp/out")
        .with_step(StepConfig::new("invert").disabled());
    let err = runner.run(&empty, &mut source(5), &mut sink).unwrap_err();
    assert!(matches!(err, WorkerError::ConfigError(_)));

    let unloadable =
        TaskConfig::new("unloadable", "/tmp/out").with_step(StepConfig::new("fail_to_load"));
    let err = runner.run(&unloadable, &mut source(5), &mut sink).unwrap_err();
    assert!(err.is_config_error());

    assert!(sink.frames().is_empty());
}

/// A checkpoint from a different configuration is ignored.
#[test]
fn test_fingerprint_mismatch_restarts_from_zero() {
    let checkpoints = TempDir::new().unwrap();
    let store = CheckpointStore::new(checkpoints.path()).unwrap();
    let task = TaskConfig::new("changed", "/tmp/out")
        .with_step(StepConfig::new("invert"))
        .with_resume(true);
    store
        .save(&CheckpointRecord::new(
            task.task_id.clone(),
            "stale-fingerprint",
            40,
            "/tmp/out",
        ))
        .unwrap();

    let shutdown = ShutdownController::new();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(2),
    );
    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(50), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.metrics.summary.skipped_frames, 0);
    assert_eq!(sink.frames().len(), 50);
}

/// A shutdown requested before the run dispatches nothing.
#[test]
fn test_shutdown_before_start_processes_nothing() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    shutdown.request_shutdown();
    let runner = common::runner(
        &checkpoints,
        common::registry(&shutdown),
        shutdown,
        common::options(4),
    );
    let task = TaskConfig::new("early", "/tmp/out")
        .with_step(StepConfig::new("invert"))
        .with_resume(true);

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(10), &mut sink).unwrap();

    assert_eq!(report.state, TaskState::Interrupted);
    assert_eq!(report.last_completed_frame, None);
    assert!(sink.frames().is_empty());
    assert!(!runner.checkpoints().exists(&task.task_id));
}

struct RisingProbe {
    next: AtomicU64,
}

impl ResourceProbe for RisingProbe {
    fn gpu_memory_mb(&self) -> Option<u64> {
        Some(self.next.fetch_add(100, Ordering::SeqCst))
    }
}

/// GPU samples are recorded and the report is exported as JSON.
#[test]
fn test_probe_and_metrics_export() {
    let checkpoints = TempDir::new().unwrap();
    let shutdown = ShutdownController::new();
    let mut options = common::options(2);
    options.gpu_sample_interval = std::time::Duration::ZERO;

    let runner = frameflow_worker::PipelineRunner::builder(
        CheckpointStore::new(checkpoints.path()).unwrap(),
    )
    .registry(common::registry(&shutdown))
    .shutdown(shutdown)
    .options(options)
    .probe(Arc::new(RisingProbe {
        next: AtomicU64::new(100),
    }))
    .build()
    .unwrap();

    let metrics_path = checkpoints.path().join("reports/run_{timestamp}.json");
    let mut task = TaskConfig::new("probed", "/tmp/out").with_step(StepConfig::new("invert"));
    task.metrics_path = Some(metrics_path);

    let mut sink = MemoryFrameSink::new();
    let report = runner.run(&task, &mut source(5), &mut sink).unwrap();

    let usage = &report.metrics.resource_usage;
    assert_eq!(usage.samples.len(), 5);
    assert_eq!(usage.peak_gpu_memory_mb, 500);
    assert!((usage.avg_gpu_memory_mb - 300.0).abs() < 1e-6);

    let exported: Vec<_> = std::fs::read_dir(checkpoints.path().join("reports"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(exported.len(), 1);
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&exported[0]).unwrap()).unwrap();
    assert_eq!(json["task_id"], "probed");
    assert_eq!(json["summary"]["processed_frames"], 5);
}
