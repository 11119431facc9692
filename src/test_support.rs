//! Shared fixtures for unit tests.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::artifact::{write_f32_artifact, NamedTensor};
use crate::gestures::SequenceClassifier;
use crate::landmarks::HandLandmarker;
use crate::letters::ProbabilisticClassifier;
use crate::types::{Frame, LandmarkSet, Point3D, NUM_LANDMARKS};

pub const TINY_FEATURES: usize = 2;

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("signlingo-ml-{}-{}-{}", name, std::process::id(), n));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Plausible hand laid out on a grid, shifted by `offset` on both axes.
pub fn open_hand(offset: f32) -> LandmarkSet {
    let mut points = [Point3D::default(); NUM_LANDMARKS];
    for (i, p) in points.iter_mut().enumerate() {
        *p = Point3D::new(
            0.3 + offset + (i % 5) as f32 * 0.05,
            0.2 + offset + (i / 5) as f32 * 0.08,
            -0.01 * i as f32,
        );
    }
    LandmarkSet::new(points)
}

/// Hand whose fingers fan out from the wrist by `spread`.
pub fn spread_hand(spread: f32) -> LandmarkSet {
    let mut points = [Point3D::default(); NUM_LANDMARKS];
    for (i, p) in points.iter_mut().enumerate().skip(1) {
        let finger = ((i - 1) / 4) as f32 - 2.0;
        let joint = ((i - 1) % 4 + 1) as f32;
        *p = Point3D::new(
            0.5 + finger * 0.03 * spread * joint,
            0.8 - joint * 0.06,
            -0.01 * joint,
        );
    }
    points[0] = Point3D::new(0.5, 0.85, 0.0);
    LandmarkSet::new(points)
}

/// Replays a script of detections, then keeps returning `fallback`.
pub struct ScriptedLandmarker {
    script: Mutex<VecDeque<Option<LandmarkSet>>>,
    fallback: Option<LandmarkSet>,
}

impl ScriptedLandmarker {
    pub fn empty() -> Self {
        Self::scripted(Vec::new(), None)
    }

    pub fn always(hand: LandmarkSet) -> Self {
        Self::scripted(Vec::new(), Some(hand))
    }

    pub fn scripted(script: Vec<Option<LandmarkSet>>, fallback: Option<LandmarkSet>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
        }
    }
}

impl HandLandmarker for ScriptedLandmarker {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    fn detect(&self, _frame: &Frame) -> Result<Option<LandmarkSet>> {
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Returns fixed probabilities and remembers the last sequence it saw.
pub struct FixedClassifier {
    pub shape: (Option<usize>, usize),
    pub probs: Vec<f32>,
    pub seen: Mutex<Vec<Vec<f32>>>,
}

impl FixedClassifier {
    pub fn new(steps: usize, features: usize, probs: Vec<f32>) -> Self {
        Self {
            shape: (Some(steps), features),
            probs,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl SequenceClassifier for FixedClassifier {
    fn input_shape(&self) -> (Option<usize>, usize) {
        self.shape
    }

    fn predict_proba(&self, sequence: &[f32], _steps: usize, _features: usize) -> Result<Vec<f32>> {
        self.seen.lock().unwrap().push(sequence.to_vec());
        Ok(self.probs.clone())
    }
}

/// Letter model stand-in with fixed output.
pub struct FixedProbabilities {
    features: usize,
    probs: Vec<f32>,
}

impl FixedProbabilities {
    pub fn new(features: usize, probs: Vec<f32>) -> Self {
        Self { features, probs }
    }
}

impl ProbabilisticClassifier for FixedProbabilities {
    fn num_features(&self) -> usize {
        self.features
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>> {
        anyhow::ensure!(features.len() == self.features, "unexpected feature count {}", features.len());
        Ok(self.probs.clone())
    }
}

fn policy() -> Value {
    json!({
        "module": "keras",
        "class_name": "DTypePolicy",
        "config": {"name": "float32"},
        "registered_name": null
    })
}

/// LSTM(1) -> Dropout -> Dense(classes, softmax) in the older serialization
/// (`batch_input_shape`, plain dtype strings).
pub fn model_config(steps: usize, features: usize, classes: usize) -> String {
    let config = json!({
        "class_name": "Sequential",
        "config": {
            "name": "sequential",
            "layers": [
                {"class_name": "InputLayer", "config": {
                    "batch_input_shape": [null, steps, features],
                    "dtype": "float32", "sparse": false, "name": "input_1"}},
                {"class_name": "LSTM", "config": {
                    "name": "lstm", "trainable": true, "dtype": "float32",
                    "return_sequences": false, "units": 1,
                    "activation": "tanh", "recurrent_activation": "sigmoid", "use_bias": true}},
                {"class_name": "Dropout", "config": {
                    "name": "dropout", "trainable": true, "dtype": "float32", "rate": 0.2}},
                {"class_name": "Dense", "config": {
                    "name": "output", "trainable": true, "dtype": "float32",
                    "units": classes, "activation": "softmax", "use_bias": true}}
            ]
        },
        "keras_version": "2.15.0",
        "backend": "tensorflow"
    });
    serde_json::to_string_pretty(&config).unwrap()
}

/// Same network in the newer serialization: `batch_shape` and
/// `DTypePolicy` objects.
pub fn modern_model_config(steps: usize, features: usize, classes: usize) -> String {
    let config = json!({
        "module": "keras",
        "class_name": "Sequential",
        "config": {
            "name": "sequential",
            "trainable": true,
            "dtype": policy(),
            "layers": [
                {"module": "keras.layers", "class_name": "InputLayer", "config": {
                    "batch_shape": [null, steps, features],
                    "dtype": "float32", "sparse": false, "name": "input_layer"}},
                {"module": "keras.layers", "class_name": "LSTM", "config": {
                    "name": "lstm", "trainable": true, "dtype": policy(),
                    "return_sequences": false, "units": 1,
                    "activation": "tanh", "recurrent_activation": "sigmoid", "use_bias": true}},
                {"module": "keras.layers", "class_name": "Dropout", "config": {
                    "name": "dropout", "trainable": true, "dtype": policy(), "rate": 0.2}},
                {"module": "keras.layers", "class_name": "Dense", "config": {
                    "name": "output", "trainable": true, "dtype": policy(),
                    "units": classes, "activation": "softmax", "use_bias": true}}
            ],
            "build_input_shape": [null, steps, features]
        },
        "build_config": {"input_shape": [null, steps, features]}
    });
    serde_json::to_string_pretty(&config).unwrap()
}

pub fn legacy_config() -> String {
    model_config(3, TINY_FEATURES, 2)
}

/// Bias-only LSTM(1) whose hidden state settles at `tanh(tanh(0.5))`,
/// followed by a Dense layer scoring `+h` for `favored` and `-h` elsewhere.
pub fn lstm_weights(features: usize, classes: usize, favored: usize) -> Vec<NamedTensor> {
    let dense: Vec<f32> = (0..classes).map(|c| if c == favored { 1.0 } else { -1.0 }).collect();
    vec![
        NamedTensor::new("lstm/kernel", vec![features, 4], vec![0.0; features * 4]),
        NamedTensor::new("lstm/recurrent_kernel", vec![1, 4], vec![0.0; 4]),
        // gates i, f, c, o
        NamedTensor::new("lstm/bias", vec![4], vec![100.0, -100.0, 0.5, 100.0]),
        NamedTensor::new("output/kernel", vec![1, classes], dense),
        NamedTensor::new("output/bias", vec![classes], vec![0.0; classes]),
    ]
}

pub fn tiny_lstm_tensors() -> HashMap<String, Tensor> {
    lstm_weights(TINY_FEATURES, 2, 0)
        .into_iter()
        .map(|t| {
            let tensor = Tensor::from_vec(t.data, t.shape, &Device::Cpu).unwrap();
            (t.name, tensor)
        })
        .collect()
}

pub fn write_tiny_model(path: &Path, config: Option<&str>) {
    write_f32_artifact(path, config, &lstm_weights(TINY_FEATURES, 2, 0)).unwrap();
}
