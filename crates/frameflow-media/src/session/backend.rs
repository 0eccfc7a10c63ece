//! Inference backend abstraction.

use std::path::Path;
use std::sync::Arc;

use frameflow_models::{ExecutionConfig, ExecutionProvider};

use crate::error::{MediaError, MediaResult};

/// Dense f32 tensor exchanged with inference sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `data` matches `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> MediaResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(MediaError::inference(format!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A loaded model ready to run inference.
///
/// Sessions are shared between worker threads through the session pool, so
/// `run` takes `&self`.
pub trait InferenceSession: Send + Sync {
    /// Model file the session was built from.
    fn model_path(&self) -> &Path;

    /// Execution providers the session was built with.
    fn providers(&self) -> &[ExecutionProvider];

    /// Run the model on one input tensor.
    fn run(&self, input: &Tensor) -> MediaResult<Tensor>;
}

/// Builds inference sessions for model files.
pub trait SessionBackend: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    /// Load `model_path` with the given execution configuration.
    fn create_session(
        &self,
        model_path: &Path,
        execution: &ExecutionConfig,
    ) -> MediaResult<Arc<dyn InferenceSession>>;
}

/// Backend used when no inference runtime is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl SessionBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn create_session(
        &self,
        model_path: &Path,
        _execution: &ExecutionConfig,
    ) -> MediaResult<Arc<dyn InferenceSession>> {
        Err(MediaError::BackendUnavailable(format!(
            "cannot load {}: built without the `onnx` feature",
            model_path.display()
        )))
    }
}

/// Backend selected by the enabled crate features.
pub fn default_backend() -> Arc<dyn SessionBackend> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(super::onnx::OrtBackend::new())
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(UnavailableBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_is_checked() {
        assert!(Tensor::new(vec![1, 3, 2, 2], vec![0.0; 12]).is_ok());
        assert!(Tensor::new(vec![2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_unavailable_backend_fails_fatally() {
        let err = UnavailableBackend
            .create_session(Path::new("m.onnx"), &ExecutionConfig::cpu())
            .err()
            .unwrap();
        assert!(matches!(err, MediaError::BackendUnavailable(_)));
        assert!(!err.is_frame_local());
    }
}
