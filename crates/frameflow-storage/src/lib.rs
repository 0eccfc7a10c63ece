//! Checkpoint persistence for resumable tasks.
//!
//! This crate provides:
//! - A self-verifying checkpoint file format (JSON envelope + SHA-256 trailer)
//! - `CheckpointStore`: one file per task, replaced atomically on save

pub mod checkpoint;
pub mod codec;
pub mod error;

pub use checkpoint::CheckpointStore;
pub use codec::{decode_checkpoint, encode_checkpoint, CHECKPOINT_FORMAT};
pub use error::{StorageError, StorageResult};
