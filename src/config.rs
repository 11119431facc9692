use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelPaths,
    pub landmarks: LandmarkSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// Artifact file names, resolved against `dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub dir: PathBuf,
    pub letters_bundle: String,
    pub gesture_model: String,
    pub gesture_labels: String,
    pub hand_landmarker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkSettings {
    pub min_detection_confidence: f32,
    pub input_size: u32,
    pub intra_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8001".to_string(),
        }
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            letters_bundle: "model.bin".to_string(),
            gesture_model: "dynamic_model.safetensors".to_string(),
            gesture_labels: "label_map.json".to_string(),
            hand_landmarker: "hand_landmark.onnx".to_string(),
        }
    }
}

impl Default for LandmarkSettings {
    fn default() -> Self {
        Self {
            min_detection_confidence: 0.5,
            input_size: 224,
            intra_threads: 1,
        }
    }
}

impl ModelPaths {
    pub fn letters_bundle_path(&self) -> PathBuf {
        self.dir.join(&self.letters_bundle)
    }

    pub fn gesture_model_path(&self) -> PathBuf {
        self.dir.join(&self.gesture_model)
    }

    pub fn gesture_labels_path(&self) -> PathBuf {
        self.dir.join(&self.gesture_labels)
    }

    pub fn hand_landmarker_path(&self) -> PathBuf {
        self.dir.join(&self.hand_landmarker)
    }
}

impl AppConfig {
    /// Missing file -> defaults. Unparseable file -> warning + defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        // Missing fields fall back to Default via #[serde(default)]
        match serde_json::from_str::<AppConfig>(&content) {
            Ok(c) => {
                info!("loaded configuration from {}", path.display());
                Ok(c)
            }
            Err(e) => {
                warn!("error parsing {}: {}. Loading defaults.", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
