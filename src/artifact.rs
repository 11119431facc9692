//! Sequence-model artifact: a safetensors container whose metadata map
//! carries the Keras-style architecture blob under [`CONFIG_KEY`] and whose
//! tensors are named `<layer>/<weight>`.

use candle_core::{Device, Tensor};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata attribute holding the serialized model configuration.
pub const CONFIG_KEY: &str = "model_config";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("safetensors error: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub struct ModelArtifact {
    path: PathBuf,
    buffer: Vec<u8>,
}

impl ModelArtifact {
    pub fn open(path: &Path) -> Result<Self, ArtifactError> {
        let buffer = fs::read(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            buffer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All metadata entries (empty when the header has none).
    pub fn metadata(&self) -> Result<HashMap<String, String>, ArtifactError> {
        let (_, metadata) = SafeTensors::read_metadata(&self.buffer)?;
        Ok(metadata.metadata().clone().unwrap_or_default())
    }

    /// The architecture blob, or `None` when the attribute is missing.
    pub fn config_blob(&self) -> Result<Option<String>, ArtifactError> {
        Ok(self.metadata()?.remove(CONFIG_KEY))
    }

    /// Tensor names and shapes, sorted by name.
    pub fn tensor_shapes(&self) -> Result<Vec<(String, Vec<usize>)>, ArtifactError> {
        let tensors = SafeTensors::deserialize(&self.buffer)?;
        let mut shapes: Vec<(String, Vec<usize>)> = tensors
            .tensors()
            .into_iter()
            .map(|(name, view)| (name, view.shape().to_vec()))
            .collect();
        shapes.sort();
        Ok(shapes)
    }

    pub fn load_tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>, ArtifactError> {
        Ok(candle_core::safetensors::load_buffer(&self.buffer, device)?)
    }

    /// Replaces the architecture blob on disk, keeping every tensor and the
    /// other metadata entries. Writes a sibling file and renames it over the
    /// original.
    pub fn rewrite_config(&mut self, blob: &str) -> Result<(), ArtifactError> {
        let mut metadata = self.metadata()?;
        metadata.insert(CONFIG_KEY.to_string(), blob.to_string());

        let tmp_path = self.path.with_extension("safetensors.tmp");
        let written = SafeTensors::deserialize(&self.buffer)
            .and_then(|tensors| safetensors::serialize_to_file(tensors.tensors(), &Some(metadata), &tmp_path))
            .map_err(ArtifactError::from)
            .and_then(|()| {
                fs::rename(&tmp_path, &self.path).map_err(|source| ArtifactError::Io {
                    path: self.path.clone(),
                    source,
                })
            });
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written?;

        self.buffer = fs::read(&self.path).map_err(|source| ArtifactError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// One f32 tensor for [`write_f32_artifact`].
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// Writes an artifact from f32 tensors. `config` goes under [`CONFIG_KEY`];
/// `None` produces an artifact without the attribute.
pub fn write_f32_artifact(
    path: &Path,
    config: Option<&str>,
    tensors: &[NamedTensor],
) -> Result<(), ArtifactError> {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|t| t.data.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();

    let mut views = Vec::with_capacity(tensors.len());
    for (t, raw) in tensors.iter().zip(&bytes) {
        views.push((t.name.clone(), TensorView::new(Dtype::F32, t.shape.clone(), raw)?));
    }

    let metadata = config.map(|blob| HashMap::from([(CONFIG_KEY.to_string(), blob.to_string())]));
    safetensors::serialize_to_file(views, &metadata, path)?;
    Ok(())
}
