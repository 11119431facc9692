#![allow(dead_code)]

use serde_json::{json, Value};
use signlingo_ml::artifact::{write_f32_artifact, NamedTensor};
use signlingo_ml::landmarks::HandLandmarker;
use signlingo_ml::types::{Frame, LandmarkSet, Point3D, NUM_LANDMARKS};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn scratch_dir(name: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("signlingo-it-{}-{}-{}", name, std::process::id(), n));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn hand(offset: f32) -> LandmarkSet {
    let mut points = [Point3D::default(); NUM_LANDMARKS];
    for (i, p) in points.iter_mut().enumerate() {
        *p = Point3D::new(0.25 + offset + (i % 5) as f32 * 0.04, 0.3 + (i / 5) as f32 * 0.06, 0.0);
    }
    LandmarkSet::new(points)
}

/// Plays back a fixed list of detections, then reports no hand. Counts calls.
pub struct ReplayLandmarker {
    frames: Mutex<VecDeque<Option<LandmarkSet>>>,
    pub calls: Arc<AtomicUsize>,
}

impl ReplayLandmarker {
    pub fn new(frames: Vec<Option<LandmarkSet>>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn repeat(hand: Option<LandmarkSet>, n: usize) -> Self {
        Self::new(vec![hand; n])
    }
}

impl HandLandmarker for ReplayLandmarker {
    fn name(&self) -> String {
        "replay".to_string()
    }

    fn detect(&self, _frame: &Frame) -> anyhow::Result<Option<LandmarkSet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.frames.lock().unwrap().pop_front().flatten())
    }
}

fn policy() -> Value {
    json!({"module": "keras", "class_name": "DTypePolicy", "config": {"name": "float32"}, "registered_name": null})
}

/// LSTM(1) -> Dense(classes) serialized the newer way (`batch_shape`,
/// `DTypePolicy` objects), the shape the strict parse rejects.
pub fn modern_config(steps: usize, features: usize, classes: usize) -> String {
    json!({
        "module": "keras",
        "class_name": "Sequential",
        "config": {
            "name": "gestures",
            "dtype": policy(),
            "layers": [
                {"module": "keras.layers", "class_name": "InputLayer", "config": {
                    "batch_shape": [null, steps, features], "dtype": "float32", "name": "input_layer"}},
                {"module": "keras.layers", "class_name": "LSTM", "config": {
                    "name": "lstm", "dtype": policy(), "units": 1, "return_sequences": false,
                    "activation": "tanh", "recurrent_activation": "sigmoid", "use_bias": true}},
                {"module": "keras.layers", "class_name": "Dense", "config": {
                    "name": "output", "dtype": policy(), "units": classes, "activation": "softmax"}}
            ],
            "build_input_shape": [null, steps, features]
        }
    })
    .to_string()
}

/// Weights that make the network favor `favored` whenever a hand is seen
/// at least once: hidden state stays at `tanh(tanh(0.5))` for any input.
pub fn weights(features: usize, classes: usize, favored: usize) -> Vec<NamedTensor> {
    let dense: Vec<f32> = (0..classes).map(|c| if c == favored { 4.0 } else { -4.0 }).collect();
    vec![
        NamedTensor::new("lstm/kernel", vec![features, 4], vec![0.0; features * 4]),
        NamedTensor::new("lstm/recurrent_kernel", vec![1, 4], vec![0.0; 4]),
        NamedTensor::new("lstm/bias", vec![4], vec![100.0, -100.0, 0.5, 100.0]),
        NamedTensor::new("output/kernel", vec![1, classes], dense),
        NamedTensor::new("output/bias", vec![classes], vec![0.0; classes]),
    ]
}

pub fn write_gesture_model(path: &Path, config: Option<&str>, features: usize, classes: usize, favored: usize) {
    write_f32_artifact(path, config, &weights(features, classes, favored)).unwrap();
}

pub fn write_labels(path: &Path, labels: &[&str]) {
    fs::write(path, serde_json::to_string(labels).unwrap()).unwrap();
}
