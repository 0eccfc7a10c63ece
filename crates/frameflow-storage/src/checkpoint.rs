//! Per-task checkpoint files.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use frameflow_models::{CheckpointRecord, TaskId};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::codec::{decode_checkpoint, encode_checkpoint};
use crate::error::StorageResult;

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Directory of checkpoint files, one per task.
///
/// Saves replace the previous file atomically, so a crash leaves either the
/// old or the new checkpoint on disk, never a partial one.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Checkpoint store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the checkpoint file for a task.
    ///
    /// Ids made only of `[A-Za-z0-9._-]` map to `<id>.ckpt`; anything else is
    /// sanitized and suffixed with a short digest of the raw id.
    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(checkpoint_file_name(task_id.as_str()))
    }

    /// Persist a record, replacing any earlier checkpoint of the same task.
    pub fn save(&self, record: &CheckpointRecord) -> StorageResult<()> {
        let mut record = record.clone();
        record.touch();

        let bytes = encode_checkpoint(&record)?;
        let path = self.path_for(&record.task_id);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(
            task_id = %record.task_id,
            frame = record.last_completed_frame,
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Read and verify a task's checkpoint without matching its fingerprint.
    ///
    /// `Ok(None)` when no checkpoint exists.
    pub fn read(&self, task_id: &TaskId) -> StorageResult<Option<CheckpointRecord>> {
        let path = self.path_for(task_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        decode_checkpoint(&bytes).map(Some)
    }

    /// Load a checkpoint usable for resuming `task_id` under `fingerprint`.
    ///
    /// Every failure is a miss: the reason is logged and `None` returned.
    pub fn load(&self, task_id: &TaskId, fingerprint: &str) -> Option<CheckpointRecord> {
        let record = match self.read(task_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %task_id, "No checkpoint found");
                return None;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Ignoring unreadable checkpoint");
                return None;
            }
        };

        if &record.task_id != task_id {
            warn!(
                task_id = %task_id,
                found = %record.task_id,
                "Ignoring checkpoint written for another task"
            );
            return None;
        }

        if record.config_fingerprint != fingerprint {
            info!(
                task_id = %task_id,
                "Ignoring checkpoint from a different configuration"
            );
            return None;
        }

        Some(record)
    }

    /// Whether a checkpoint file exists for the task (it is not verified).
    pub fn exists(&self, task_id: &TaskId) -> bool {
        self.path_for(task_id).is_file()
    }

    /// Remove a task's checkpoint. A missing file is not an error.
    pub fn cleanup(&self, task_id: &TaskId) -> StorageResult<()> {
        match fs::remove_file(self.path_for(task_id)) {
            Ok(()) => {
                debug!(task_id = %task_id, "Checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn checkpoint_file_name(task_id: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');

    if !task_id.is_empty() && task_id.chars().all(is_safe) {
        return format!("{}.{}", task_id, CHECKPOINT_EXTENSION);
    }

    let sanitized: String = task_id
        .chars()
        .map(|c| if is_safe(c) { c } else { '_' })
        .collect();
    let digest = format!("{:x}", Sha256::digest(task_id.as_bytes()));

    format!("{}-{}.{}", sanitized, &digest[..12], CHECKPOINT_EXTENSION)
}
