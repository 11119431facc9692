use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::LandmarkSettings;
use crate::types::{Frame, LandmarkSet, Point3D, NUM_LANDMARKS};

/// Output index of the 21 x 3 landmark coordinates.
pub const LANDMARK_OUTPUT: usize = 0;
/// Output index of the hand presence score.
pub const PRESENCE_OUTPUT: usize = 1;

/// What the landmarker reads from a given model output.
pub fn output_role(idx: usize) -> &'static str {
    match idx {
        LANDMARK_OUTPUT => "landmarks",
        PRESENCE_OUTPUT => "presence",
        _ => "unused",
    }
}

/// Black-box hand keypoint extraction: zero or one hand per frame.
pub trait HandLandmarker: Send + Sync {
    fn name(&self) -> String;
    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkSet>>;
}

/// Full-frame MediaPipe-style hand landmark model (NHWC, [0, 1] input).
///
/// Output 0 carries 21 (x, y, z) triples in input-pixel units, output 1 the
/// hand presence score.
pub struct OnnxHandLandmarker {
    session: Mutex<Session>,
    input_size: u32,
    min_presence: f32,
}

impl OnnxHandLandmarker {
    pub fn new(model_path: &Path, settings: &LandmarkSettings) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!(
                "hand landmark model not found at {}",
                model_path.display()
            ));
        }

        info!("loading hand landmarker from {}", model_path.display());
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(settings.intra_threads.max(1))?
            .with_execution_providers([
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load {}", model_path.display()))?;

        if session.outputs.len() < 2 {
            return Err(anyhow!(
                "hand landmark model must expose landmarks and presence outputs, found {}",
                session.outputs.len()
            ));
        }

        Ok(Self {
            session: Mutex::new(session),
            input_size: settings.input_size,
            min_presence: settings.min_detection_confidence,
        })
    }

    fn preprocess(&self, frame: &Frame) -> Vec<f32> {
        to_nhwc(frame, self.input_size)
    }
}

/// Element count of a `1 x size x size x 3` input, counted in `usize`.
fn nhwc_len(size: u32) -> usize {
    let side = size as usize;
    side * side * 3
}

/// Resizes to `size x size` and flattens RGB to NHWC scaled into [0, 1].
fn to_nhwc(frame: &Frame, size: u32) -> Vec<f32> {
    let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);
    let mut input_data = Vec::with_capacity(nhwc_len(size));
    for pixel in resized.pixels() {
        input_data.push(pixel[0] as f32 / 255.0);
        input_data.push(pixel[1] as f32 / 255.0);
        input_data.push(pixel[2] as f32 / 255.0);
    }
    input_data
}

impl HandLandmarker for OnnxHandLandmarker {
    fn name(&self) -> String {
        format!("Hand Landmarks ({} pts)", NUM_LANDMARKS)
    }

    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkSet>> {
        let size = self.input_size as usize;
        let input_data = self.preprocess(frame);
        let input = Tensor::from_array((vec![1, size, size, 3], input_data))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("hand landmark session lock poisoned"))?;
        let outputs = session.run(ort::inputs![input])?;

        let (_presence_shape, presence) = outputs[PRESENCE_OUTPUT].try_extract_tensor::<f32>()?;
        let score = presence.first().copied().unwrap_or(0.0);
        if score < self.min_presence {
            debug!("no hand (presence {:.3})", score);
            return Ok(None);
        }

        let (_coord_shape, coords) = outputs[LANDMARK_OUTPUT].try_extract_tensor::<f32>()?;
        decode_landmarks(coords, self.input_size as f32).map(Some)
    }
}

/// Converts raw model output (input-pixel units) into normalized keypoints.
pub fn decode_landmarks(raw: &[f32], input_size: f32) -> Result<LandmarkSet> {
    if raw.len() < NUM_LANDMARKS * 3 {
        return Err(anyhow!(
            "landmark output too short: {} values",
            raw.len()
        ));
    }
    let points: Vec<Point3D> = raw
        .chunks_exact(3)
        .take(NUM_LANDMARKS)
        .map(|c| Point3D::new(c[0] / input_size, c[1] / input_size, c[2] / input_size))
        .collect();
    LandmarkSet::from_points(&points)
}
