use anyhow::{anyhow, Context, Result};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::gestures::{load_label_map, GestureDetector};
use crate::landmarks::OnnxHandLandmarker;
use crate::letters::{LetterBundle, LetterClassifier};
use crate::model_loader::CompatLoader;
use crate::types::{Frame, Mode, Prediction};

/// Everything request handlers need, built once at startup.
///
/// Either mode may be missing; predictions for a missing mode degrade to the
/// no-hand sentinel instead of erroring.
pub struct PredictionService {
    letters: Option<LetterClassifier>,
    gestures: Option<Mutex<GestureDetector>>,
}

impl PredictionService {
    pub fn new(letters: Option<LetterClassifier>, gestures: Option<GestureDetector>) -> Self {
        Self {
            letters,
            gestures: gestures.map(Mutex::new),
        }
    }

    /// Loads both modes independently; a failure only disables its own mode.
    pub fn load(config: &AppConfig) -> Self {
        let letters = match load_letters(config) {
            Ok(clf) => Some(clf),
            Err(e) => {
                warn!("letters mode disabled: {:#}", e);
                None
            }
        };
        let gestures = match load_gestures(config) {
            Ok(det) => Some(det),
            Err(e) => {
                warn!("gestures mode disabled: {:#}", e);
                None
            }
        };
        info!(
            "prediction service up (letters: {}, gestures: {})",
            letters.is_some(),
            gestures.is_some()
        );
        Self::new(letters, gestures)
    }

    pub fn is_enabled(&self, mode: Mode) -> bool {
        match mode {
            Mode::Letters => self.letters.is_some(),
            Mode::Gestures => self.gestures.is_some(),
        }
    }

    pub fn predict(&self, mode: Mode, frame: &Frame) -> Result<Prediction> {
        match mode {
            Mode::Letters => match &self.letters {
                Some(clf) => clf.predict(frame),
                None => Ok(Prediction::none()),
            },
            Mode::Gestures => match &self.gestures {
                Some(det) => det
                    .lock()
                    .map_err(|_| anyhow!("gesture detector lock poisoned"))?
                    .predict(frame),
                None => Ok(Prediction::none()),
            },
        }
    }
}

fn load_letters(config: &AppConfig) -> Result<LetterClassifier> {
    let bundle = LetterBundle::load(&config.models.letters_bundle_path())?;
    let landmarker = OnnxHandLandmarker::new(&config.models.hand_landmarker_path(), &config.landmarks)?;
    Ok(LetterClassifier::new(Box::new(landmarker), bundle))
}

fn load_gestures(config: &AppConfig) -> Result<GestureDetector> {
    let model_path = config.models.gesture_model_path();
    if !model_path.exists() {
        return Err(anyhow!("gesture model not found at {}", model_path.display()));
    }
    let labels = load_label_map(&config.models.gesture_labels_path())?;
    let model = CompatLoader::standard(candle_core::Device::Cpu)
        .load(&model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let landmarker = OnnxHandLandmarker::new(&config.models.hand_landmarker_path(), &config.landmarks)?;
    GestureDetector::new(Box::new(landmarker), Box::new(model), labels)
}
