//! Frame pipeline worker binary.
//!
//! Runs the task described by `FRAMEFLOW_TASK_FILE` over the raw frames in
//! `FRAMEFLOW_INPUT_DIR`. Exits 0 when the task completed, 130 when it was
//! interrupted (and can be resumed) and 1 otherwise.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{error, info, warn};

use frameflow_media::{RawFrameDirectory, RawFrameWriter, StepRegistry};
use frameflow_models::TaskConfig;
use frameflow_worker::logging::init_tracing;
use frameflow_worker::shutdown::shutdown_signal;
use frameflow_worker::telemetry::init_metrics;
use frameflow_worker::{register_builtin_steps, PipelineRunner, ShutdownController, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Worker error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    info!("Starting frameflow-worker");

    let prometheus = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let task_file = config
        .task_file
        .clone()
        .ok_or_else(|| anyhow!("FRAMEFLOW_TASK_FILE is not set"))?;
    let input_dir = config
        .input_dir
        .clone()
        .ok_or_else(|| anyhow!("FRAMEFLOW_INPUT_DIR is not set"))?;

    let raw = std::fs::read_to_string(&task_file)
        .with_context(|| format!("reading task file {}", task_file.display()))?;
    let task: TaskConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing task file {}", task_file.display()))?;

    let mut source = RawFrameDirectory::open(&input_dir)
        .with_context(|| format!("opening input frames in {}", input_dir.display()))?;
    let mut sink = RawFrameWriter::create(&task.output_path, source.layout())
        .with_context(|| format!("creating output in {}", task.output_path.display()))?;

    let registry = Arc::new(StepRegistry::new());
    register_builtin_steps(&registry);

    let shutdown = ShutdownController::new();
    shutdown
        .install(
            || info!("Shutdown started, finishing in-flight frames"),
            config.shutdown_timeout,
            || {
                error!("Shutdown timed out, exiting");
                std::process::exit(1);
            },
        )
        .context("installing shutdown handler")?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.request_shutdown();
    });

    let runner = PipelineRunner::from_config(&config, registry, shutdown.clone())
        .context("creating pipeline runner")?;

    let report = tokio::task::spawn_blocking(move || runner.run(&task, &mut source, &mut sink))
        .await
        .context("pipeline thread failed")??;

    if shutdown.is_shutdown_requested() {
        shutdown.mark_completed();
    }

    if let Some(handle) = prometheus {
        info!("Worker metrics:\n{}", handle.render());
    }

    info!(
        task_id = %report.task_id,
        state = %report.state,
        last_completed_frame = ?report.last_completed_frame,
        "Worker finished"
    );
    Ok(report.exit_code())
}

