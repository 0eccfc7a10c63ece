//! Persisted task progress.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::TaskId;

/// Version of the on-disk checkpoint layout.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Progress of a task as persisted between runs.
///
/// A record is only trusted for resumption when its `config_fingerprint`
/// matches the fingerprint of the task being started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointRecord {
    /// Task this record belongs to
    pub task_id: TaskId,

    /// Digest of the effective processing configuration
    pub config_fingerprint: String,

    /// Highest frame index whose output was fully written
    pub last_completed_frame: u64,

    /// Total frames in the source (0 when unknown)
    #[serde(default)]
    pub total_frames: u64,

    /// Output location at the time of the checkpoint
    pub output_path: PathBuf,

    /// Size of the output written so far, in bytes
    #[serde(default)]
    pub output_file_size: u64,

    /// Opaque per-step state
    #[serde(default)]
    pub step_state: serde_json::Value,

    /// When the first checkpoint for this run was taken
    pub created_at: DateTime<Utc>,

    /// When this record was last written
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Create a record for a task that has completed `last_completed_frame`.
    pub fn new(
        task_id: TaskId,
        config_fingerprint: impl Into<String>,
        last_completed_frame: u64,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            config_fingerprint: config_fingerprint.into(),
            last_completed_frame,
            total_frames: 0,
            output_path: output_path.into(),
            output_file_size: 0,
            step_state: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_total_frames(mut self, total_frames: u64) -> Self {
        self.total_frames = total_frames;
        self
    }

    pub fn with_output_size(mut self, bytes: u64) -> Self {
        self.output_file_size = bytes;
        self
    }

    /// First frame a resumed run must process.
    pub fn resume_frame(&self) -> u64 {
        self.last_completed_frame.saturating_add(1)
    }

    /// Completion percentage, `None` when the total is unknown.
    pub fn progress_percent(&self) -> Option<f64> {
        if self.total_frames == 0 {
            return None;
        }
        let done = self.resume_frame().min(self.total_frames);
        Some(done as f64 / self.total_frames as f64 * 100.0)
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
