//! Loads sequence-model artifacts that may have been written by a newer
//! serializer than the strict schema understands, trying progressively more
//! lenient strategies.

use candle_core::Device;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactError, ModelArtifact, CONFIG_KEY};
use crate::compat::patch_artifact_in_place;
use crate::sequence_model::{Architecture, CompatScope, SequenceModel};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("{} has no '{}' attribute", .0.display(), CONFIG_KEY)]
    MissingConfig(PathBuf),

    #[error("malformed model config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed model config: {0}")]
    MalformedConfig(String),

    #[error("unknown precision policy class '{0}'")]
    UnknownClass(String),

    #[error("unsupported {what}: {detail}")]
    Unsupported { what: &'static str, detail: String },

    #[error("missing weight '{0}'")]
    MissingWeight(String),

    #[error("weight '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("compatibility patch made no changes")]
    PatchNotApplicable,

    #[error("every load strategy failed for {}: {}", .path.display(), summarize(.attempts))]
    Exhausted {
        path: PathBuf,
        attempts: Vec<(&'static str, LoadError)>,
    },
}

fn summarize(attempts: &[(&'static str, LoadError)]) -> String {
    attempts
        .iter()
        .map(|(name, err)| format!("[{name}] {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One way of turning an artifact into a model.
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn load(&self, path: &Path, device: &Device) -> Result<SequenceModel, LoadError>;
}

/// Strict schema parse with the given alias scope.
pub struct NativeLoad {
    pub scope: CompatScope,
}

impl LoadStrategy for NativeLoad {
    fn name(&self) -> &'static str {
        "native"
    }

    fn load(&self, path: &Path, device: &Device) -> Result<SequenceModel, LoadError> {
        SequenceModel::from_artifact(path, &self.scope, device)
    }
}

/// Rewrites the artifact's config in place, then retries the strict parse.
pub struct PatchAndRetry {
    pub scope: CompatScope,
}

impl LoadStrategy for PatchAndRetry {
    fn name(&self) -> &'static str {
        "patch-and-retry"
    }

    fn load(&self, path: &Path, device: &Device) -> Result<SequenceModel, LoadError> {
        if !patch_artifact_in_place(path)? {
            return Err(LoadError::PatchNotApplicable);
        }
        SequenceModel::from_artifact(path, &self.scope, device)
    }
}

/// Reads the architecture leniently from the raw JSON tree and attaches the
/// stored weights after checking their shapes.
pub struct ManualReconstruction;

impl LoadStrategy for ManualReconstruction {
    fn name(&self) -> &'static str {
        "manual-reconstruction"
    }

    fn load(&self, path: &Path, device: &Device) -> Result<SequenceModel, LoadError> {
        let artifact = ModelArtifact::open(path)?;
        let blob = artifact
            .config_blob()?
            .ok_or_else(|| LoadError::MissingConfig(path.to_path_buf()))?;
        let arch = Architecture::reconstruct(&blob)?;
        SequenceModel::build(arch, artifact.load_tensors(device)?, device)
    }
}

pub struct CompatLoader {
    strategies: Vec<Box<dyn LoadStrategy>>,
    device: Device,
}

impl CompatLoader {
    pub fn new(strategies: Vec<Box<dyn LoadStrategy>>, device: Device) -> Self {
        Self { strategies, device }
    }

    /// native -> patch-and-retry -> manual-reconstruction, all with the
    /// standard alias scope.
    pub fn standard(device: Device) -> Self {
        Self::new(
            vec![
                Box::new(NativeLoad {
                    scope: CompatScope::standard(),
                }),
                Box::new(PatchAndRetry {
                    scope: CompatScope::standard(),
                }),
                Box::new(ManualReconstruction),
            ],
            device,
        )
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// First successful strategy wins; otherwise every failure is returned
    /// in order.
    pub fn load(&self, path: &Path) -> Result<SequenceModel, LoadError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.load(path, &self.device) {
                Ok(model) => {
                    if attempts.is_empty() {
                        debug!("loaded {} via {}", path.display(), strategy.name());
                    } else {
                        info!(
                            "loaded {} via {} after {} failed attempt(s)",
                            path.display(),
                            strategy.name(),
                            attempts.len()
                        );
                    }
                    return Ok(model);
                }
                Err(err) => {
                    warn!("{} load of {} failed: {}", strategy.name(), path.display(), err);
                    attempts.push((strategy.name(), err));
                }
            }
        }
        Err(LoadError::Exhausted {
            path: path.to_path_buf(),
            attempts,
        })
    }
}

/// Loads with the standard strategy chain on the CPU.
pub fn load_model_compat(path: &Path) -> Result<SequenceModel, LoadError> {
    CompatLoader::standard(Device::Cpu).load(path)
}
