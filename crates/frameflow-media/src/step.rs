//! Processing steps and the registry that builds them.
//!
//! A task names its steps by string id. The registry maps each id to a
//! constructor that receives a [`StepContext`] and returns a boxed
//! [`ProcessingStep`]; constructors are registered at runtime, so the set of
//! steps is open.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use frameflow_models::{ExecutionConfig, SessionKey, StepConfig};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{MediaError, MediaResult};
use crate::frame::Frame;
use crate::model::ModelProvider;
use crate::session::{guarded_factory, InferenceSession, SessionBackend, SessionHandle, SessionPool};

/// One transformation applied to every frame of a task.
///
/// Steps are shared by the worker threads that process frames of the same
/// task, so `process` takes `&self`.
pub trait ProcessingStep: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire models and sessions before the first frame.
    fn ensure_loaded(&mut self) -> MediaResult<()> {
        Ok(())
    }

    /// Transform a frame in place.
    fn process(&self, frame: &mut Frame) -> MediaResult<()>;

    /// State to persist with a checkpoint, if any.
    fn checkpoint_state(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Session pool specialised for inference sessions.
pub type InferenceSessionPool = SessionPool<dyn InferenceSession>;

/// Everything a step constructor may use.
#[derive(Clone)]
pub struct StepContext {
    pub config: StepConfig,
    pub execution: ExecutionConfig,
    pub sessions: Arc<InferenceSessionPool>,
    pub models: Arc<dyn ModelProvider>,
    pub backend: Arc<dyn SessionBackend>,
}

impl StepContext {
    /// Typed step parameter, `None` when absent.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> MediaResult<Option<T>> {
        self.config
            .params
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    MediaError::invalid_config(format!(
                        "step '{}' parameter '{}': {}",
                        self.config.step, key, e
                    ))
                })
            })
            .transpose()
    }

    /// The model configured for this step.
    pub fn model_name(&self) -> MediaResult<&str> {
        self.config.model.as_deref().ok_or_else(|| {
            MediaError::invalid_config(format!("step '{}' requires a model", self.config.step))
        })
    }

    /// Resolve a model file.
    pub fn model_path(&self, model: &str) -> MediaResult<PathBuf> {
        self.models.resolve(model)
    }

    /// Check out the pooled session of `model` for this step's execution
    /// configuration, creating it on first use.
    pub fn session(&self, model: &str) -> MediaResult<SessionHandle<dyn InferenceSession>> {
        let path = self.models.resolve(model)?;
        let key = SessionKey::derive(&path.to_string_lossy(), &self.execution);

        let backend = Arc::clone(&self.backend);
        let execution = self.execution.clone();
        self.sessions.get_or_create(&key, move || {
            guarded_factory(move || backend.create_session(&path, &execution))
        })
    }
}

/// Constructor of a processing step.
pub type StepConstructor =
    Arc<dyn Fn(&StepContext) -> MediaResult<Box<dyn ProcessingStep>> + Send + Sync>;

/// Registry of step constructors keyed by step id.
#[derive(Default)]
pub struct StepRegistry {
    constructors: RwLock<HashMap<String, StepConstructor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any earlier one for `id`.
    pub fn register<F>(&self, id: impl Into<String>, constructor: F)
    where
        F: Fn(&StepContext) -> MediaResult<Box<dyn ProcessingStep>> + Send + Sync + 'static,
    {
        let id = id.into();
        let previous = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(constructor));

        if previous.is_some() {
            debug!(step = %id, "Replaced step constructor");
        } else {
            debug!(step = %id, "Registered step");
        }
    }

    /// Build the step registered under `id`.
    pub fn create(&self, id: &str, ctx: &StepContext) -> MediaResult<Box<dyn ProcessingStep>> {
        // Clone the constructor out so it runs without holding the lock.
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| MediaError::unknown_step(id))?;

        constructor(ctx)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Collect the checkpoint state of a step chain, keyed by step name.
pub fn collect_step_state(steps: &[Box<dyn ProcessingStep>]) -> serde_json::Value {
    let states: serde_json::Map<String, serde_json::Value> = steps
        .iter()
        .filter_map(|step| step.checkpoint_state().map(|s| (step.name().to_string(), s)))
        .collect();

    if states.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::Object(states)
    }
}
