//! Configuration fingerprint used to match checkpoints to task configs.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use frameflow_models::TaskConfig;

use crate::error::WorkerResult;

/// SHA-256 over the canonical JSON of everything that changes frame output:
/// the enabled steps (id, model, params) and the execution configuration.
///
/// Object keys are sorted and execution providers normalized, so two configs
/// that differ only in key or provider order fingerprint the same.
pub fn config_fingerprint(config: &TaskConfig) -> WorkerResult<String> {
    let steps: Vec<Value> = config
        .enabled_steps()
        .map(|step| {
            json!({
                "step": step.step,
                "model": step.model,
                "params": step.params,
            })
        })
        .collect();

    let document = json!({
        "steps": steps,
        "execution": serde_json::to_value(config.execution.normalized())?,
    });

    let canonical = serde_json::to_string(&canonicalize(document))?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
