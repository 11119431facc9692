use anyhow::{bail, Result};
use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decoded RGB camera frame.
pub type Frame = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// Keypoints per detected hand.
pub const NUM_LANDMARKS: usize = 21;
/// Values per temporal feature vector (x, y, z for every landmark).
pub const SEQUENCE_FEATURES: usize = NUM_LANDMARKS * 3; // 63
/// Frames in the gesture window.
pub const SEQUENCE_LENGTH: usize = 30;
/// Fraction of the window that must hold a detected hand before predicting.
pub const MIN_VALID_RATIO: f32 = 0.6;

// MediaPipe hand topology
pub const WRIST: usize = 0;
pub const THUMB_TIP: usize = 4;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_MCP: usize = 9;
pub const MIDDLE_TIP: usize = 12;
pub const RING_TIP: usize = 16;
pub const PINKY_TIP: usize = 20;
pub const FINGER_TIPS: [usize; 5] = [THUMB_TIP, INDEX_TIP, MIDDLE_TIP, RING_TIP, PINKY_TIP];

/// Represents a single 3D point
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3D {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance in the image plane.
    pub fn planar_distance(&self, other: &Point3D) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// One detected hand: exactly 21 keypoints in normalized image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: [Point3D; NUM_LANDMARKS],
}

impl LandmarkSet {
    pub fn new(points: [Point3D; NUM_LANDMARKS]) -> Self {
        Self { points }
    }

    pub fn from_points(points: &[Point3D]) -> Result<Self> {
        if points.len() != NUM_LANDMARKS {
            bail!(
                "expected {} hand landmarks, got {}",
                NUM_LANDMARKS,
                points.len()
            );
        }
        let mut fixed = [Point3D::default(); NUM_LANDMARKS];
        fixed.copy_from_slice(points);
        Ok(Self { points: fixed })
    }

    pub fn points(&self) -> &[Point3D; NUM_LANDMARKS] {
        &self.points
    }

    pub fn point(&self, idx: usize) -> Point3D {
        self.points[idx]
    }

    /// Flattens to `[x0, y0, z0, x1, ...]` for the sequence model.
    pub fn to_sequence_features(&self) -> FeatureVector {
        let mut values = Vec::with_capacity(SEQUENCE_FEATURES);
        for p in &self.points {
            values.extend([p.x, p.y, p.z]);
        }
        FeatureVector(values)
    }
}

/// Flat numeric features derived from one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Index -> label table loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    labels: Vec<Option<String>>,
}

impl LabelMap {
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self {
            labels: labels.into_iter().map(Some).collect(),
        }
    }

    /// Inverts a `label -> index` mapping. Indices not claimed by any label
    /// stay unresolved.
    pub fn from_label_indices<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a usize)>,
    {
        let mut labels: Vec<Option<String>> = Vec::new();
        for (label, &idx) in pairs {
            if idx >= labels.len() {
                labels.resize(idx + 1, None);
            }
            labels[idx] = Some(label.clone());
        }
        Self { labels }
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).and_then(|l| l.as_deref())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Outcome of one predict call. `label == None` means "nothing to report"
/// and always carries zero confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Option<String>,
    pub confidence: f32,
}

impl Prediction {
    pub fn none() -> Self {
        Self {
            label: None,
            confidence: 0.0,
        }
    }

    pub fn new(label: Option<String>, confidence: f32) -> Self {
        match label {
            Some(label) => Self {
                label: Some(label),
                confidence: if confidence.is_finite() {
                    confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                },
            },
            None => Self::none(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.label.is_none()
    }
}

/// Picks the arg-max of a probability distribution.
/// Returns `None` for an empty distribution. NaN entries never win.
pub fn arg_max(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .fold(None, |best, (idx, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((idx, p)),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Letters,
    Gestures,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Letters => "letters",
            Mode::Gestures => "gestures",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "letters" => Ok(Mode::Letters),
            "gestures" => Ok(Mode::Gestures),
            other => bail!("unknown mode '{}'", other),
        }
    }
}
