use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use smartcore::api::Transformer;
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::LogisticRegression;
use smartcore::preprocessing::numerical::StandardScaler;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::landmarks::HandLandmarker;
use crate::static_features::encode_static_features;
use crate::types::{arg_max, Frame, LabelMap, Prediction};

/// Fitted multinomial logistic regression; row `k` scores class index `k`.
pub type LetterModel = LogisticRegression<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// Anything that turns one feature row into class probabilities.
pub trait ProbabilisticClassifier: Send + Sync {
    fn num_features(&self) -> usize;
    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>>;
}

impl ProbabilisticClassifier for LetterModel {
    fn num_features(&self) -> usize {
        self.coefficients().shape().1
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>> {
        let coefficients = self.coefficients();
        let intercept = self.intercept();
        let (classes, cols) = coefficients.shape();
        if cols != features.len() {
            bail!("classifier expects {} features, got {}", cols, features.len());
        }

        let logits: Vec<f64> = (0..classes)
            .map(|k| {
                let dot: f64 = features
                    .iter()
                    .enumerate()
                    .map(|(c, &x)| *coefficients.get((k, c)) * x as f64)
                    .sum();
                dot + *intercept.get((k, 0))
            })
            .collect();

        let probs = match logits.as_slice() {
            // binary models keep a single row scoring the second class
            [z] => {
                let p = 1.0 / (1.0 + (-z).exp());
                vec![1.0 - p, p]
            }
            _ => softmax(&logits),
        };
        Ok(probs.into_iter().map(|p| p as f32).collect())
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max_logit = logits.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f64> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum_exps: f64 = exps.iter().sum();
    exps.iter().map(|&x| x / sum_exps).collect()
}

/// Runs one feature row through a fitted scaler. Zero-variance columns come
/// out non-finite and are pinned to 0.
pub fn scale_features(scaler: &StandardScaler<f64>, features: &[f32]) -> Result<Vec<f32>> {
    let row = DenseMatrix::from_2d_vec(&vec![features.iter().map(|&v| v as f64).collect()]);
    let scaled = scaler.transform(&row).context("scaler rejected feature row")?;
    let (_, cols) = scaled.shape();
    Ok((0..cols)
        .map(|c| {
            let v = *scaled.get((0, c));
            if v.is_finite() {
                v as f32
            } else {
                0.0
            }
        })
        .collect())
}

/// On-disk letters artifact (bincode).
#[derive(Serialize, Deserialize)]
pub struct LetterBundle {
    pub model: LetterModel,
    /// label -> class index, e.g. {"A": 0, "B": 1}
    pub label_map: HashMap<String, usize>,
    pub scaler: Option<StandardScaler<f64>>,
}

impl LetterBundle {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("letters bundle not found at {}", path.display()));
        }
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        bincode::deserialize(&bytes)
            .with_context(|| format!("failed to decode letters bundle {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Single-frame letter recognition. Holds no per-call state.
pub struct LetterClassifier {
    landmarker: Box<dyn HandLandmarker>,
    model: Box<dyn ProbabilisticClassifier>,
    scaler: Option<StandardScaler<f64>>,
    labels: LabelMap,
}

impl LetterClassifier {
    pub fn new(landmarker: Box<dyn HandLandmarker>, bundle: LetterBundle) -> Self {
        let labels = LabelMap::from_label_indices(bundle.label_map.iter());
        Self::from_parts(landmarker, Box::new(bundle.model), bundle.scaler, labels)
    }

    pub fn from_parts(
        landmarker: Box<dyn HandLandmarker>,
        model: Box<dyn ProbabilisticClassifier>,
        scaler: Option<StandardScaler<f64>>,
        labels: LabelMap,
    ) -> Self {
        info!(
            "letters classifier ready: {} classes, {} features, scaler: {}",
            labels.len(),
            model.num_features(),
            scaler.is_some()
        );
        Self {
            landmarker,
            model,
            scaler,
            labels,
        }
    }

    pub fn predict(&self, frame: &Frame) -> Result<Prediction> {
        let hand = match self.landmarker.detect(frame)? {
            Some(hand) => hand,
            None => return Ok(Prediction::none()),
        };

        let features = encode_static_features(&hand);
        let features = match &self.scaler {
            Some(scaler) => scale_features(scaler, features.as_slice())?,
            None => features.into_inner(),
        };

        let probs = self.model.predict_proba(&features)?;
        let (idx, conf) = arg_max(&probs).ok_or_else(|| anyhow!("classifier returned no probabilities"))?;
        Ok(Prediction::new(self.labels.get(idx).map(str::to_string), conf))
    }
}
