//! Checkpoint file encoding.
//!
//! A checkpoint file is a pretty-printed JSON envelope followed by one
//! trailer line:
//!
//! ```text
//! {
//!   "format": "frameflow-checkpoint",
//!   "version": 1,
//!   "record": { ... }
//! }
//! #sha256:<lowercase hex digest of every byte above>
//! ```
//!
//! Any modification, truncation or appended byte fails verification.

use frameflow_models::{CheckpointRecord, CHECKPOINT_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

/// Format tag written into every checkpoint envelope.
pub const CHECKPOINT_FORMAT: &str = "frameflow-checkpoint";

const TRAILER_PREFIX: &[u8] = b"#sha256:";

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: &'a str,
    version: u32,
    record: &'a CheckpointRecord,
}

#[derive(Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    record: CheckpointRecord,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Serialize a record into checkpoint file bytes.
pub fn encode_checkpoint(record: &CheckpointRecord) -> StorageResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(&EnvelopeRef {
        format: CHECKPOINT_FORMAT,
        version: CHECKPOINT_FORMAT_VERSION,
        record,
    })?;
    bytes.push(b'\n');

    let digest = sha256_hex(&bytes);
    bytes.extend_from_slice(TRAILER_PREFIX);
    bytes.extend_from_slice(digest.as_bytes());
    bytes.push(b'\n');

    Ok(bytes)
}

/// Verify and parse checkpoint file bytes.
pub fn decode_checkpoint(bytes: &[u8]) -> StorageResult<CheckpointRecord> {
    let content = bytes
        .strip_suffix(b"\n")
        .ok_or_else(|| StorageError::corrupt("missing trailer newline"))?;

    let split = content
        .iter()
        .rposition(|&b| b == b'\n')
        .ok_or_else(|| StorageError::corrupt("missing integrity trailer"))?;
    let (body, trailer) = content.split_at(split + 1);

    let expected = trailer
        .strip_prefix(TRAILER_PREFIX)
        .ok_or_else(|| StorageError::corrupt("malformed integrity trailer"))?;
    let expected = std::str::from_utf8(expected)
        .map_err(|_| StorageError::corrupt("integrity trailer is not UTF-8"))?;

    let actual = sha256_hex(body);
    if actual != expected {
        return Err(StorageError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| StorageError::corrupt(format!("invalid envelope: {}", e)))?;

    if envelope.format != CHECKPOINT_FORMAT {
        return Err(StorageError::corrupt(format!(
            "unexpected format tag '{}'",
            envelope.format
        )));
    }
    if envelope.version != CHECKPOINT_FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: envelope.version,
            expected: CHECKPOINT_FORMAT_VERSION,
        });
    }

    Ok(envelope.record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frameflow_models::TaskId;

    fn sample() -> CheckpointRecord {
        CheckpointRecord::new(TaskId::from("task-1"), "abc123", 41, "/tmp/out")
            .with_total_frames(100)
            .with_output_size(4096)
    }

    #[test]
    fn test_encode_decode() {
        let record = sample();
        let bytes = encode_checkpoint(&record).unwrap();
        assert_eq!(decode_checkpoint(&bytes).unwrap(), record);
    }

    #[test]
    fn test_flipped_byte_fails_integrity() {
        let mut bytes = encode_checkpoint(&sample()).unwrap();
        let pos = bytes.windows(2).position(|w| w == b"41").unwrap();
        bytes[pos] = b'9';

        assert!(matches!(
            decode_checkpoint(&bytes),
            Err(StorageError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_and_appended_fail() {
        let bytes = encode_checkpoint(&sample()).unwrap();

        assert!(decode_checkpoint(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_checkpoint(&bytes[..bytes.len() / 2]).is_err());
        assert!(decode_checkpoint(&[]).is_err());

        let mut appended = bytes.clone();
        appended.push(b'\n');
        assert!(decode_checkpoint(&appended).is_err());

        let mut appended = bytes;
        appended.extend_from_slice(b"x\n");
        assert!(decode_checkpoint(&appended).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let record = sample();
        let mut body = serde_json::to_vec_pretty(&serde_json::json!({
            "format": CHECKPOINT_FORMAT,
            "version": CHECKPOINT_FORMAT_VERSION + 1,
            "record": record,
        }))
        .unwrap();
        body.push(b'\n');
        let digest = sha256_hex(&body);
        body.extend_from_slice(format!("#sha256:{}\n", digest).as_bytes());

        assert!(matches!(
            decode_checkpoint(&body),
            Err(StorageError::UnsupportedVersion { .. })
        ));
    }
}
