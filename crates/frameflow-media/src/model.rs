//! Model name resolution.
//!
//! Steps refer to models by logical name; a [`ModelProvider`] turns that name
//! into a verified local file. Models are never downloaded here: a missing
//! file is reported as [`MediaError::ModelNotFound`].

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{MediaError, MediaResult};

const MODEL_EXTENSION: &str = "onnx";

/// Resolves logical model names to local model files.
pub trait ModelProvider: Send + Sync {
    fn resolve(&self, name: &str) -> MediaResult<PathBuf>;
}

/// Manifest entry of a known model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// File path, relative to the provider root unless absolute
    pub file: PathBuf,
    /// Expected SHA-256 of the file (lowercase hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Model provider over a local model directory.
///
/// Names listed in the manifest resolve to their configured file, anything
/// else to `<root>/<name>.onnx`. Checksums are verified on first resolution
/// and the verified path is cached.
pub struct LocalModelProvider {
    root: PathBuf,
    manifest: HashMap<String, ModelSpec>,
    verified: Mutex<HashMap<String, PathBuf>>,
}

impl LocalModelProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest: HashMap::new(),
            verified: Mutex::new(HashMap::new()),
        }
    }

    /// Load a JSON manifest (`{"name": {"file": "...", "sha256": "..."}}`).
    pub fn from_manifest_file(root: impl Into<PathBuf>, manifest: &Path) -> MediaResult<Self> {
        let bytes = std::fs::read(manifest)?;
        let entries: HashMap<String, ModelSpec> = serde_json::from_slice(&bytes)?;
        debug!(
            manifest = %manifest.display(),
            models = entries.len(),
            "Loaded model manifest"
        );

        let mut provider = Self::new(root);
        provider.manifest = entries;
        Ok(provider)
    }

    pub fn with_model(mut self, name: impl Into<String>, spec: ModelSpec) -> Self {
        self.manifest.insert(name.into(), spec);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, name: &str) -> (PathBuf, Option<&str>) {
        match self.manifest.get(name) {
            Some(spec) => {
                let path = if spec.file.is_absolute() {
                    spec.file.clone()
                } else {
                    self.root.join(&spec.file)
                };
                (path, spec.sha256.as_deref())
            }
            None => (
                self.root.join(format!("{}.{}", name, MODEL_EXTENSION)),
                None,
            ),
        }
    }
}

impl ModelProvider for LocalModelProvider {
    fn resolve(&self, name: &str) -> MediaResult<PathBuf> {
        if let Some(path) = self
            .verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(path.clone());
        }

        let (path, expected) = self.locate(name);
        if !path.is_file() {
            return Err(MediaError::model_not_found(format!(
                "{} (looked for {})",
                name,
                path.display()
            )));
        }

        if let Some(expected) = expected {
            let actual = sha256_file(&path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(MediaError::ModelChecksumMismatch {
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        info!(model = name, path = %path.display(), "Resolved model");
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), path.clone());

        Ok(path)
    }
}

fn sha256_file(path: &Path) -> MediaResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
