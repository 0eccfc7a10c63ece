//! Task definitions for the job engine.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::ExecutionConfig;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a task run.
///
/// `Starting -> Running -> {Completed | Failed | Interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Resolving steps, fingerprint and checkpoint
    #[default]
    Starting,
    /// Frames are being processed
    Running,
    /// All frames processed, checkpoint removed
    Completed,
    /// Aborted by a fatal error (checkpoint kept)
    Failed,
    /// Stopped by a shutdown request (checkpoint kept)
    Interrupted,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Interrupted
        )
    }

    /// Whether a later run with the same configuration can pick up from the
    /// persisted checkpoint.
    pub fn is_resumable(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Interrupted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_enabled() -> bool {
    true
}

/// One entry of a task's ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepConfig {
    /// Registry identifier of the step (e.g. "face_swapper")
    pub step: String,

    /// Disabled steps are skipped and excluded from the fingerprint
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Logical model name, for steps backed by an inference session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Step-specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl StepConfig {
    /// Create an enabled step without model or parameters.
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            enabled: true,
            model: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A task to be executed by the pipeline runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskConfig {
    /// Unique task ID (also names the checkpoint file)
    pub task_id: TaskId,

    /// Ordered processing steps
    pub steps: Vec<StepConfig>,

    /// Execution configuration shared by session-backed steps
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Output location handed to the frame sink
    pub output_path: PathBuf,

    /// Load and persist checkpoints for this task
    #[serde(default)]
    pub enable_resume: bool,

    /// Where to export the metrics report, `{timestamp}` is substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<PathBuf>,
}

impl TaskConfig {
    /// Create a task with no steps.
    pub fn new(task_id: impl Into<TaskId>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            steps: Vec::new(),
            execution: ExecutionConfig::default(),
            output_path: output_path.into(),
            enable_resume: false,
            metrics_path: None,
        }
    }

    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.enable_resume = enabled;
        self
    }

    /// Steps that take part in processing, in order.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &StepConfig> {
        self.steps.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Starting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Interrupted.is_resumable());
        assert!(!TaskState::Completed.is_resumable());
    }

    #[test]
    fn test_task_config_defaults_from_json() {
        let json = r#"{
            "task_id": "t1",
            "steps": [{"step": "face_swapper", "model": "inswapper_128"}, {"step": "x", "enabled": false}],
            "output_path": "/tmp/out"
        }"#;
        let task: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id.as_str(), "t1");
        assert!(!task.enable_resume);
        assert_eq!(task.enabled_steps().count(), 1);
        assert_eq!(task.steps[0].model.as_deref(), Some("inswapper_128"));
    }
}
