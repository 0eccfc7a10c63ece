//! Execution configuration and session cache keys.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Backend execution provider.
///
/// The declaration order is the canonical sort order used when normalizing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProvider {
    Cpu,
    Cuda,
    TensorRt,
    CoreMl,
    DirectMl,
    Rocm,
}

impl ExecutionProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionProvider::Cpu => "cpu",
            ExecutionProvider::Cuda => "cuda",
            ExecutionProvider::TensorRt => "tensorrt",
            ExecutionProvider::CoreMl => "coreml",
            ExecutionProvider::DirectMl => "directml",
            ExecutionProvider::Rocm => "rocm",
        }
    }

    /// Whether the provider runs on an accelerator device.
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, ExecutionProvider::Cpu)
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend session is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionConfig {
    /// Providers in preference order as configured
    #[serde(default)]
    pub providers: Vec<ExecutionProvider>,

    /// Accelerator device index
    #[serde(default)]
    pub device_id: i32,

    /// Backend-specific tuning (e.g. TensorRT workspace size)
    #[serde(default)]
    pub tuning: BTreeMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ExecutionConfig {
    /// CPU-only execution on device 0.
    pub fn cpu() -> Self {
        Self {
            providers: vec![ExecutionProvider::Cpu],
            device_id: 0,
            tuning: BTreeMap::new(),
        }
    }

    pub fn with_providers(mut self, providers: impl IntoIterator<Item = ExecutionProvider>) -> Self {
        self.providers = providers.into_iter().collect();
        self
    }

    pub fn with_device(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_tuning(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tuning.insert(key.into(), value.into());
        self
    }

    /// Canonical form: providers sorted and de-duplicated, CPU when empty.
    pub fn normalized(&self) -> Self {
        let mut providers = self.providers.clone();
        providers.sort();
        providers.dedup();
        if providers.is_empty() {
            providers.push(ExecutionProvider::Cpu);
        }

        Self {
            providers,
            device_id: self.device_id,
            tuning: self.tuning.clone(),
        }
    }
}

/// Cache key of a pooled backend session.
///
/// Derived from the model identity and the *normalized* execution config, so
/// two configurations that normalize identically share one session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive the key for a model and execution configuration.
    ///
    /// The model id and tuning entries are written as JSON strings, so
    /// separators inside them cannot make two configurations collide.
    pub fn derive(model_id: &str, config: &ExecutionConfig) -> Self {
        let normalized = config.normalized();

        let providers = normalized
            .providers
            .iter()
            .map(ExecutionProvider::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let tuning = normalized
            .tuning
            .iter()
            .map(|(k, v)| format!("{}={}", quote(k), quote(v)))
            .collect::<Vec<_>>()
            .join(";");

        Self(format!(
            "{}|ep:{}|dev:{}|tune:{}",
            quote(model_id),
            providers,
            normalized.device_id,
            tuning
        ))
    }

    /// Wrap an already-derived key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn quote(raw: &str) -> String {
    serde_json::Value::from(raw).to_string()
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_configs_share_key() {
        let a = ExecutionConfig::cpu()
            .with_providers([ExecutionProvider::TensorRt, ExecutionProvider::Cuda])
            .with_tuning("trt_workspace", "1073741824");
        let b = ExecutionConfig::cpu()
            .with_providers([
                ExecutionProvider::Cuda,
                ExecutionProvider::TensorRt,
                ExecutionProvider::Cuda,
            ])
            .with_tuning("trt_workspace", "1073741824");

        assert_eq!(
            SessionKey::derive("models/inswapper.onnx", &a),
            SessionKey::derive("models/inswapper.onnx", &b)
        );
    }

    #[test]
    fn test_device_and_model_change_key() {
        let base = ExecutionConfig::cpu().with_providers([ExecutionProvider::Cuda]);
        let key = SessionKey::derive("m.onnx", &base);

        assert_ne!(key, SessionKey::derive("m.onnx", &base.clone().with_device(1)));
        assert_ne!(key, SessionKey::derive("other.onnx", &base));
    }

    #[test]
    fn test_separators_in_values_do_not_collide() {
        let split = ExecutionConfig::cpu()
            .with_tuning("a", "1")
            .with_tuning("b", "2");
        let packed = ExecutionConfig::cpu().with_tuning("a", "1;b=2");
        assert_ne!(SessionKey::derive("m", &split), SessionKey::derive("m", &packed));

        let cpu = ExecutionConfig::cpu();
        let tuned = ExecutionConfig::cpu().with_tuning("x", "y|ep:cpu|dev:0|tune:");
        assert_ne!(
            SessionKey::derive("m|ep:cpu|dev:0|tune:x=y", &cpu),
            SessionKey::derive("m", &tuned)
        );
    }

    #[test]
    fn test_empty_providers_normalize_to_cpu() {
        let empty = ExecutionConfig::cpu().with_providers([]);
        assert_eq!(
            SessionKey::derive("m", &empty),
            SessionKey::derive("m", &ExecutionConfig::cpu())
        );
    }
}
