//! ONNX Runtime inference backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use frameflow_models::{ExecutionConfig, ExecutionProvider};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, ROCmExecutionProvider,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor as OrtTensor, Value};
use tracing::info;

use super::backend::{InferenceSession, SessionBackend, Tensor};
use crate::error::{MediaError, MediaResult};

/// Registration rank; ORT tries providers in the order they are registered.
fn provider_rank(provider: ExecutionProvider) -> u8 {
    match provider {
        ExecutionProvider::TensorRt => 0,
        ExecutionProvider::Cuda => 1,
        ExecutionProvider::Rocm => 2,
        ExecutionProvider::DirectMl => 3,
        ExecutionProvider::CoreMl => 4,
        ExecutionProvider::Cpu => 5,
    }
}

fn dispatch_for(provider: ExecutionProvider, execution: &ExecutionConfig) -> ExecutionProviderDispatch {
    let device = execution.device_id;
    match provider {
        ExecutionProvider::TensorRt => {
            let fp16 = execution
                .tuning
                .get("trt_fp16")
                .is_some_and(|v| v == "true" || v == "1");
            TensorRTExecutionProvider::default()
                .with_device_id(device)
                .with_fp16(fp16)
                .build()
        }
        ExecutionProvider::Cuda => CUDAExecutionProvider::default()
            .with_device_id(device)
            .build(),
        ExecutionProvider::Rocm => ROCmExecutionProvider::default()
            .with_device_id(device)
            .build(),
        ExecutionProvider::DirectMl => DirectMLExecutionProvider::default()
            .with_device_id(device)
            .build(),
        ExecutionProvider::CoreMl => CoreMLExecutionProvider::default().build(),
        ExecutionProvider::Cpu => CPUExecutionProvider::default().build(),
    }
}

/// Session backend on top of ONNX Runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SessionBackend for OrtBackend {
    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn create_session(
        &self,
        model_path: &Path,
        execution: &ExecutionConfig,
    ) -> MediaResult<Arc<dyn InferenceSession>> {
        if !model_path.exists() {
            return Err(MediaError::FileNotFound(model_path.to_path_buf()));
        }

        let normalized = execution.normalized();
        let mut ordered = normalized.providers.clone();
        ordered.sort_by_key(|p| provider_rank(*p));
        let dispatches: Vec<_> = ordered
            .iter()
            .map(|p| dispatch_for(*p, &normalized))
            .collect();

        let model_bytes = std::fs::read(model_path)?;

        let mut builder = Session::builder()
            .map_err(|e| MediaError::session_creation(format!("ORT session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| MediaError::session_creation(format!("ORT opt level: {e}")))?;

        if let Some(threads) = normalized
            .tuning
            .get("intra_threads")
            .and_then(|v| v.parse::<usize>().ok())
        {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| MediaError::session_creation(format!("ORT intra threads: {e}")))?;
        }

        let session = builder
            .with_execution_providers(dispatches)
            .map_err(|e| MediaError::session_creation(format!("ORT providers: {e}")))?
            .commit_from_memory(model_bytes.as_slice())
            .map_err(|e| MediaError::session_creation(format!("ORT load model: {e}")))?;

        info!(
            model = %model_path.display(),
            providers = ?normalized.providers,
            device = normalized.device_id,
            "Created ONNX Runtime session"
        );

        Ok(Arc::new(OrtSession {
            session: Mutex::new(session),
            model_path: model_path.to_path_buf(),
            providers: normalized.providers,
        }))
    }
}

/// ONNX Runtime session wrapper.
pub struct OrtSession {
    session: Mutex<Session>,
    model_path: PathBuf,
    providers: Vec<ExecutionProvider>,
}

impl InferenceSession for OrtSession {
    fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn providers(&self) -> &[ExecutionProvider] {
        &self.providers
    }

    fn run(&self, input: &Tensor) -> MediaResult<Tensor> {
        let value = OrtTensor::from_array((input.shape.clone(), input.data.clone().into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| MediaError::inference(format!("ORT tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| MediaError::inference("ORT session poisoned"))?;

        let outputs = session
            .run(ort::inputs![value])
            .map_err(|e| MediaError::inference(format!("ORT run failed: {e}")))?;

        if outputs.len() == 0 {
            return Err(MediaError::inference("ORT returned no outputs"));
        }

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MediaError::inference(format!("ORT extract: {e}")))?;

        Tensor::new(
            shape.iter().map(|&d| d.max(0) as usize).collect(),
            data.to_vec(),
        )
    }
}
