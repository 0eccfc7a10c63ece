//! Built-in processing steps.

use frameflow_media::{
    Frame, InferenceSession, MediaError, MediaResult, ProcessingStep, SessionHandle, StepContext,
    StepRegistry, Tensor,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Register every built-in step.
pub fn register_builtin_steps(registry: &StepRegistry) {
    registry.register("passthrough", |_ctx: &StepContext| {
        Ok(Box::new(PassthroughStep) as Box<dyn ProcessingStep>)
    });
    registry.register("invert", |ctx: &StepContext| {
        let skip_alpha = ctx.param::<bool>("skip_alpha")?.unwrap_or(true);
        Ok(Box::new(InvertStep::new(skip_alpha)) as Box<dyn ProcessingStep>)
    });
    registry.register("model_filter", |ctx: &StepContext| {
        Ok(Box::new(ModelFilterStep::new(ctx)?) as Box<dyn ProcessingStep>)
    });
}

/// Leaves frames untouched.
pub struct PassthroughStep;

impl ProcessingStep for PassthroughStep {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process(&self, _frame: &mut Frame) -> MediaResult<()> {
        Ok(())
    }
}

/// Inverts every sample (`255 - v`), optionally leaving the alpha channel of
/// 4-channel frames alone.
pub struct InvertStep {
    skip_alpha: bool,
}

impl InvertStep {
    pub fn new(skip_alpha: bool) -> Self {
        Self { skip_alpha }
    }
}

impl ProcessingStep for InvertStep {
    fn name(&self) -> &str {
        "invert"
    }

    fn process(&self, frame: &mut Frame) -> MediaResult<()> {
        frame.validate()?;

        let channels = frame.channels as usize;
        let keep_alpha = self.skip_alpha && channels == 4;
        for (i, sample) in frame.data.iter_mut().enumerate() {
            if keep_alpha && i % channels == 3 {
                continue;
            }
            *sample = 255 - *sample;
        }
        Ok(())
    }
}

/// Runs each frame through an inference model.
///
/// The frame is converted to a `[1, C, H, W]` tensor scaled to `0..1` and the
/// model output, which must have the same number of elements, is scaled back
/// into the frame.
pub struct ModelFilterStep {
    ctx: StepContext,
    model: String,
    session: Option<SessionHandle<dyn InferenceSession>>,
    frames: AtomicU64,
}

impl ModelFilterStep {
    pub fn new(ctx: &StepContext) -> MediaResult<Self> {
        let model = ctx.model_name()?.to_string();
        Ok(Self {
            ctx: ctx.clone(),
            model,
            session: None,
            frames: AtomicU64::new(0),
        })
    }
}

impl ProcessingStep for ModelFilterStep {
    fn name(&self) -> &str {
        "model_filter"
    }

    fn ensure_loaded(&mut self) -> MediaResult<()> {
        if self.session.is_none() {
            let session = self.ctx.session(&self.model)?;
            debug!(model = %self.model, pooled = session.is_pooled(), "Model session ready");
            self.session = Some(session);
        }
        Ok(())
    }

    fn process(&self, frame: &mut Frame) -> MediaResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| MediaError::internal("model_filter used before ensure_loaded"))?;
        frame.validate()?;

        let input = frame_to_tensor(frame)?;
        let output = session.run(&input)?;
        if output.len() != frame.data.len() {
            return Err(MediaError::inference(format!(
                "model {} returned {} values for a frame of {}",
                self.model,
                output.len(),
                frame.data.len()
            )));
        }
        tensor_into_frame(&output, frame);

        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn checkpoint_state(&self) -> Option<serde_json::Value> {
        Some(json!({
            "model": self.model,
            "frames": self.frames.load(Ordering::Relaxed),
        }))
    }
}

/// Interleaved HWC bytes to a planar `[1, C, H, W]` tensor in `0..1`.
fn frame_to_tensor(frame: &Frame) -> MediaResult<Tensor> {
    let (w, h, c) = (
        frame.width as usize,
        frame.height as usize,
        frame.channels as usize,
    );
    let mut data = vec![0f32; frame.data.len()];
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                data[ch * h * w + y * w + x] = frame.data[(y * w + x) * c + ch] as f32 / 255.0;
            }
        }
    }
    Tensor::new(vec![1, c, h, w], data)
}

/// Planar tensor back into the frame's interleaved bytes, clamped to `0..=255`.
fn tensor_into_frame(tensor: &Tensor, frame: &mut Frame) {
    let (w, h, c) = (
        frame.width as usize,
        frame.height as usize,
        frame.channels as usize,
    );
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let value = tensor.data[ch * h * w + y * w + x];
                frame.data[(y * w + x) * c + ch] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameflow_media::{
        InferenceSessionPool, ModelProvider, PoolConfig, SessionBackend,
    };
    use frameflow_models::{ExecutionConfig, ExecutionProvider, StepConfig};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct Negate {
        path: PathBuf,
    }

    impl InferenceSession for Negate {
        fn model_path(&self) -> &Path {
            &self.path
        }

        fn providers(&self) -> &[ExecutionProvider] {
            &[ExecutionProvider::Cpu]
        }

        fn run(&self, input: &Tensor) -> MediaResult<Tensor> {
            Tensor::new(
                input.shape.clone(),
                input.data.iter().map(|v| 1.0 - v).collect(),
            )
        }
    }

    struct NegateBackend;

    impl SessionBackend for NegateBackend {
        fn name(&self) -> &'static str {
            "negate"
        }

        fn create_session(
            &self,
            model_path: &Path,
            _execution: &ExecutionConfig,
        ) -> MediaResult<Arc<dyn InferenceSession>> {
            Ok(Arc::new(Negate {
                path: model_path.to_path_buf(),
            }))
        }
    }

    struct OneModel;

    impl ModelProvider for OneModel {
        fn resolve(&self, name: &str) -> MediaResult<PathBuf> {
            match name {
                "negate" => Ok(PathBuf::from("/models/negate.onnx")),
                other => Err(MediaError::model_not_found(other)),
            }
        }
    }

    fn context(step: StepConfig) -> StepContext {
        StepContext {
            config: step,
            execution: ExecutionConfig::cpu(),
            sessions: Arc::new(InferenceSessionPool::new(PoolConfig::default())),
            models: Arc::new(OneModel),
            backend: Arc::new(NegateBackend),
        }
    }

    #[test]
    fn test_builtin_registration() {
        let registry = StepRegistry::new();
        register_builtin_steps(&registry);
        assert_eq!(
            registry.names(),
            vec!["invert", "model_filter", "passthrough"]
        );
    }

    #[test]
    fn test_invert_keeps_alpha_by_default() {
        let registry = StepRegistry::new();
        register_builtin_steps(&registry);
        let step = registry
            .create("invert", &context(StepConfig::new("invert")))
            .unwrap();

        let mut frame = Frame::new(0, 1, 1, 4, vec![0, 10, 255, 128]).unwrap();
        step.process(&mut frame).unwrap();
        assert_eq!(frame.data, vec![255, 245, 0, 128]);

        let mut rgb = Frame::new(0, 1, 1, 3, vec![0, 10, 255]).unwrap();
        step.process(&mut rgb).unwrap();
        assert_eq!(rgb.data, vec![255, 245, 0]);
    }

    #[test]
    fn test_invert_rejects_malformed_frames() {
        let mut frame = Frame::filled(3, 2, 2, 3, 0);
        frame.data.pop();
        let err = InvertStep::new(true).process(&mut frame).unwrap_err();
        assert!(err.is_frame_local());
    }

    #[test]
    fn test_model_filter_runs_session() {
        let ctx = context(StepConfig::new("model_filter").with_model("negate"));
        let mut step = ModelFilterStep::new(&ctx).unwrap();
        step.ensure_loaded().unwrap();
        assert_eq!(ctx.sessions.size(), 1);

        let mut frame = Frame::new(0, 2, 1, 2, vec![0, 255, 100, 55]).unwrap();
        step.process(&mut frame).unwrap();
        assert_eq!(frame.data, vec![255, 0, 155, 200]);
        assert_eq!(step.checkpoint_state().unwrap()["frames"], 1);
    }

    #[test]
    fn test_model_filter_requires_model() {
        let ctx = context(StepConfig::new("model_filter"));
        assert!(matches!(
            ModelFilterStep::new(&ctx),
            Err(MediaError::InvalidConfig(_))
        ));

        let ctx = context(StepConfig::new("model_filter").with_model("absent"));
        let mut step = ModelFilterStep::new(&ctx).unwrap();
        assert!(matches!(
            step.ensure_loaded(),
            Err(MediaError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_tensor_layout_is_planar() {
        let frame = Frame::new(0, 2, 1, 3, vec![255, 0, 0, 0, 255, 0]).unwrap();
        let tensor = frame_to_tensor(&frame).unwrap();
        assert_eq!(tensor.shape, vec![1, 3, 1, 2]);
        assert_eq!(tensor.data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }
}
