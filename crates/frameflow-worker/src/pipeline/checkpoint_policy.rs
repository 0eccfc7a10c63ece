//! When to write checkpoints, and a writer that enforces it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frameflow_models::CheckpointRecord;
use frameflow_storage::CheckpointStore;
use tracing::{debug, warn};

use crate::telemetry;

/// Checkpoint cadence: every `every_frames` completed frames and/or whenever
/// `interval` has elapsed since the last save.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointPolicy {
    /// 0 disables the frame trigger
    pub every_frames: u64,
    pub interval: Option<Duration>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_frames: 50,
            interval: Some(Duration::from_secs(30)),
        }
    }
}

impl CheckpointPolicy {
    pub fn should_checkpoint(&self, frames_since_save: u64, since_save: Duration) -> bool {
        let by_frames = self.every_frames > 0 && frames_since_save >= self.every_frames;
        let by_time = self
            .interval
            .is_some_and(|interval| frames_since_save > 0 && since_save >= interval);
        by_frames || by_time
    }
}

struct WriterState {
    last_saved: Option<u64>,
    last_save_at: Instant,
    frames_since: u64,
}

/// Persists checkpoints for one task run.
///
/// Saves only ever move forward: a record whose `last_completed_frame` is not
/// newer than the last one written is skipped. Write failures are logged and
/// counted but never abort the task.
pub struct CheckpointWriter<'a> {
    store: &'a CheckpointStore,
    policy: CheckpointPolicy,
    enabled: bool,
    state: Mutex<WriterState>,
}

impl<'a> CheckpointWriter<'a> {
    pub fn new(store: &'a CheckpointStore, policy: CheckpointPolicy, enabled: bool) -> Self {
        Self {
            store,
            policy,
            enabled,
            state: Mutex::new(WriterState {
                last_saved: None,
                last_save_at: Instant::now(),
                frames_since: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Last frame persisted by this writer.
    pub fn last_saved(&self) -> Option<u64> {
        self.lock().last_saved
    }

    /// Note a completed frame and save if the policy says so. `make_record`
    /// is only called when a checkpoint is due.
    pub fn frame_completed<F>(&self, frame: u64, make_record: F) -> bool
    where
        F: FnOnce() -> CheckpointRecord,
    {
        if !self.enabled {
            return false;
        }

        let mut state = self.lock();
        state.frames_since += 1;
        if !self
            .policy
            .should_checkpoint(state.frames_since, state.last_save_at.elapsed())
        {
            return false;
        }

        let record = make_record();
        debug_assert_eq!(record.last_completed_frame, frame);
        self.write(&mut state, record)
    }

    /// Save `record` regardless of cadence (final checkpoint on interrupt or
    /// failure).
    pub fn save_now(&self, record: CheckpointRecord) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.lock();
        self.write(&mut state, record)
    }

    fn write(&self, state: &mut WriterState, record: CheckpointRecord) -> bool {
        let frame = record.last_completed_frame;
        if state.last_saved.is_some_and(|last| frame <= last) {
            debug!(
                task_id = %record.task_id,
                frame,
                "Checkpoint not newer than the last one, skipping"
            );
            return false;
        }

        match self.store.save(&record) {
            Ok(()) => {
                state.last_saved = Some(frame);
                state.last_save_at = Instant::now();
                state.frames_since = 0;
                telemetry::record_checkpoint_write(true);
                true
            }
            Err(e) => {
                telemetry::record_checkpoint_write(false);
                warn!(
                    task_id = %record.task_id,
                    frame,
                    error = %e,
                    "Failed to save checkpoint, continuing"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameflow_models::TaskId;
    use tempfile::TempDir;

    fn record(frame: u64) -> CheckpointRecord {
        CheckpointRecord::new(TaskId::from("t"), "fp", frame, "/tmp/out")
    }

    #[test]
    fn test_policy_triggers() {
        let policy = CheckpointPolicy {
            every_frames: 10,
            interval: Some(Duration::from_secs(5)),
        };
        assert!(!policy.should_checkpoint(9, Duration::from_secs(1)));
        assert!(policy.should_checkpoint(10, Duration::ZERO));
        assert!(policy.should_checkpoint(1, Duration::from_secs(5)));
        assert!(!policy.should_checkpoint(0, Duration::from_secs(60)));

        let frames_only = CheckpointPolicy {
            every_frames: 0,
            interval: None,
        };
        assert!(!frames_only.should_checkpoint(1000, Duration::from_secs(3600)));
    }

    #[test]
    fn test_writer_saves_on_cadence() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let policy = CheckpointPolicy {
            every_frames: 3,
            interval: None,
        };
        let writer = CheckpointWriter::new(&store, policy, true);

        let saved: Vec<bool> = (0..6)
            .map(|frame| writer.frame_completed(frame, || record(frame)))
            .collect();
        assert_eq!(saved, vec![false, false, true, false, false, true]);
        assert_eq!(writer.last_saved(), Some(5));

        let on_disk = store.read(&TaskId::from("t")).unwrap().unwrap();
        assert_eq!(on_disk.last_completed_frame, 5);
    }

    #[test]
    fn test_writer_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let writer = CheckpointWriter::new(&store, CheckpointPolicy::default(), true);

        assert!(writer.save_now(record(10)));
        assert!(!writer.save_now(record(10)));
        assert!(!writer.save_now(record(4)));
        assert!(writer.save_now(record(11)));

        let on_disk = store.read(&TaskId::from("t")).unwrap().unwrap();
        assert_eq!(on_disk.last_completed_frame, 11);
    }

    #[test]
    fn test_disabled_writer_is_inert() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let writer = CheckpointWriter::new(&store, CheckpointPolicy::default(), false);

        assert!(!writer.save_now(record(3)));
        assert!(!store.exists(&TaskId::from("t")));
    }
}
