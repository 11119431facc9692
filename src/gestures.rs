use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::landmarks::HandLandmarker;
use crate::types::{arg_max, FeatureVector, Frame, LabelMap, Prediction, MIN_VALID_RATIO, SEQUENCE_FEATURES, SEQUENCE_LENGTH};

/// Temporal model scoring a `[steps, features]` sequence.
pub trait SequenceClassifier: Send + Sync {
    /// `(steps, features)`; `None` steps accepts any length.
    fn input_shape(&self) -> (Option<usize>, usize);
    fn predict_proba(&self, sequence: &[f32], steps: usize, features: usize) -> Result<Vec<f32>>;
}

/// One window slot: a frame's landmarks, or a gap where no hand was seen.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEntry {
    Present(FeatureVector),
    Absent,
}

impl WindowEntry {
    pub fn is_present(&self) -> bool {
        matches!(self, WindowEntry::Present(_))
    }
}

/// Fixed-capacity buffer, oldest entry evicted first.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: WindowEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }

    /// Share of present entries, measured against the full capacity.
    pub fn valid_ratio(&self) -> f32 {
        self.present_count() as f32 / self.capacity as f32
    }

    /// Row-major `[len, features]`, oldest first, gaps as zero rows.
    pub fn to_dense(&self, features: usize) -> Result<Vec<f32>> {
        let mut dense = Vec::with_capacity(self.entries.len() * features);
        for entry in &self.entries {
            match entry {
                WindowEntry::Present(v) => {
                    if v.len() != features {
                        bail!("window entry has {} features, expected {}", v.len(), features);
                    }
                    dense.extend_from_slice(v.as_slice());
                }
                WindowEntry::Absent => dense.extend(std::iter::repeat(0.0).take(features)),
            }
        }
        Ok(dense)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Filling,
    Ready,
}

/// Sliding-window gesture recognizer. One instance per camera session;
/// callers serialize `predict`.
pub struct GestureDetector {
    landmarker: Box<dyn HandLandmarker>,
    model: Box<dyn SequenceClassifier>,
    labels: LabelMap,
    window: SlidingWindow,
}

impl GestureDetector {
    pub fn new(
        landmarker: Box<dyn HandLandmarker>,
        model: Box<dyn SequenceClassifier>,
        labels: LabelMap,
    ) -> Result<Self> {
        let (steps, features) = model.input_shape();
        if features != SEQUENCE_FEATURES {
            bail!("gesture model expects {} features per step, need {}", features, SEQUENCE_FEATURES);
        }
        if let Some(steps) = steps {
            if steps != SEQUENCE_LENGTH {
                bail!("gesture model expects {} steps, window holds {}", steps, SEQUENCE_LENGTH);
            }
        }
        info!(
            "gesture detector ready: {} labels, window {}x{}, landmarker {}",
            labels.len(),
            SEQUENCE_LENGTH,
            SEQUENCE_FEATURES,
            landmarker.name()
        );
        Ok(Self {
            landmarker,
            model,
            labels,
            window: SlidingWindow::new(SEQUENCE_LENGTH),
        })
    }

    pub fn predict(&mut self, frame: &Frame) -> Result<Prediction> {
        let entry = match self.landmarker.detect(frame)? {
            Some(hand) => WindowEntry::Present(hand.to_sequence_features()),
            None => WindowEntry::Absent,
        };
        self.observe(entry)
    }

    /// Pushes one entry and scores the window once it is full and mostly
    /// populated.
    pub fn observe(&mut self, entry: WindowEntry) -> Result<Prediction> {
        self.window.push(entry);
        if !self.window.is_full() {
            return Ok(Prediction::none());
        }

        let ratio = self.window.valid_ratio();
        if ratio < MIN_VALID_RATIO {
            debug!("window too sparse ({:.2} valid)", ratio);
            return Ok(Prediction::none());
        }

        let dense = self.window.to_dense(SEQUENCE_FEATURES)?;
        let probs = self
            .model
            .predict_proba(&dense, SEQUENCE_LENGTH, SEQUENCE_FEATURES)?;
        let (idx, conf) = arg_max(&probs).ok_or_else(|| anyhow!("sequence model returned no probabilities"))?;
        Ok(Prediction::new(self.labels.get(idx).map(str::to_string), conf))
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn state(&self) -> DetectorState {
        if self.window.is_full() {
            DetectorState::Ready
        } else {
            DetectorState::Filling
        }
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }
}

/// Reads the index-to-label array (`["hello", "thanks", ...]`).
pub fn load_label_map(path: &Path) -> Result<LabelMap> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let labels: Vec<String> =
        serde_json::from_str(&text).with_context(|| format!("{} is not a JSON array of labels", path.display()))?;
    Ok(LabelMap::from_labels(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_hand, scratch_dir, FixedClassifier, ScriptedLandmarker};
    use std::sync::Arc;

    /// Forwards to a shared fake so tests can inspect what the detector sent.
    struct Shared(Arc<FixedClassifier>);

    impl SequenceClassifier for Shared {
        fn input_shape(&self) -> (Option<usize>, usize) {
            self.0.input_shape()
        }
        fn predict_proba(&self, sequence: &[f32], steps: usize, features: usize) -> Result<Vec<f32>> {
            self.0.predict_proba(sequence, steps, features)
        }
    }

    fn labels() -> LabelMap {
        LabelMap::from_labels(vec!["hello".into(), "thanks".into(), "yes".into()])
    }

    fn detector(probs: Vec<f32>) -> (GestureDetector, Arc<FixedClassifier>) {
        let fake = Arc::new(FixedClassifier::new(SEQUENCE_LENGTH, SEQUENCE_FEATURES, probs));
        let det = GestureDetector::new(
            Box::new(ScriptedLandmarker::empty()),
            Box::new(Shared(fake.clone())),
            labels(),
        )
        .unwrap();
        (det, fake)
    }

    fn present(v: f32) -> WindowEntry {
        WindowEntry::Present(FeatureVector::new(vec![v; SEQUENCE_FEATURES]))
    }

    #[test]
    fn fewer_than_thirty_frames_never_predict() {
        let (mut det, fake) = detector(vec![0.1, 0.8, 0.1]);
        for _ in 0..SEQUENCE_LENGTH - 1 {
            assert_eq!(det.observe(present(1.0)).unwrap(), Prediction::none());
            assert_eq!(det.state(), DetectorState::Filling);
        }
        assert!(fake.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn eighteen_of_thirty_is_enough() {
        let (mut det, fake) = detector(vec![0.1, 0.8, 0.1]);
        for i in 0..SEQUENCE_LENGTH {
            let entry = if i < 18 { present(1.0) } else { WindowEntry::Absent };
            let p = det.observe(entry).unwrap();
            if i == SEQUENCE_LENGTH - 1 {
                assert_eq!(p.label.as_deref(), Some("thanks"));
                assert!((p.confidence - 0.8).abs() < 1e-6);
            }
        }
        assert_eq!(det.state(), DetectorState::Ready);
        assert_eq!(fake.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn seventeen_of_thirty_is_not() {
        let (mut det, fake) = detector(vec![0.1, 0.8, 0.1]);
        let mut last = None;
        for i in 0..SEQUENCE_LENGTH {
            let entry = if i < 17 { present(1.0) } else { WindowEntry::Absent };
            last = Some(det.observe(entry).unwrap());
        }
        assert_eq!(last, Some(Prediction::none()));
        assert!(fake.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn gaps_become_zero_rows_in_window_order() {
        let (mut det, fake) = detector(vec![1.0, 0.0, 0.0]);
        for i in 0..SEQUENCE_LENGTH {
            let entry = if i % 3 == 2 { WindowEntry::Absent } else { present(i as f32 + 1.0) };
            det.observe(entry).unwrap();
        }
        let seen = fake.seen.lock().unwrap();
        let dense = &seen[0];
        assert_eq!(dense.len(), SEQUENCE_LENGTH * SEQUENCE_FEATURES);
        let row = |r: usize| &dense[r * SEQUENCE_FEATURES..(r + 1) * SEQUENCE_FEATURES];
        assert!(row(0).iter().all(|&v| v == 1.0));
        assert!(row(1).iter().all(|&v| v == 2.0));
        assert!(row(2).iter().all(|&v| v == 0.0));
        assert!(row(28).iter().all(|&v| v == 29.0));
        // 29 % 3 == 2, so the newest slot is a gap too
        assert!(row(29).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn oldest_frame_is_evicted_after_thirty_one() {
        let (mut det, fake) = detector(vec![0.0, 1.0, 0.0]);
        det.observe(present(99.0)).unwrap();
        for _ in 0..SEQUENCE_LENGTH {
            det.observe(present(1.0)).unwrap();
        }
        assert_eq!(det.window().len(), SEQUENCE_LENGTH);
        let seen = fake.seen.lock().unwrap();
        // 30th call saw the marker frame, 31st must not
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0][0], 99.0);
        assert!(seen[1].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut window = SlidingWindow::new(SEQUENCE_LENGTH);
        for i in 0..100 {
            window.push(if i % 2 == 0 { present(0.0) } else { WindowEntry::Absent });
            assert!(window.len() <= SEQUENCE_LENGTH);
        }
        assert_eq!(window.present_count(), 15);
        assert!((window.valid_ratio() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn no_hand_frame_advances_window_with_a_gap() {
        let (mut det, _) = detector(vec![1.0, 0.0, 0.0]);
        let p = det.predict(&Frame::new(8, 8)).unwrap();
        assert_eq!(p, Prediction::none());
        assert_eq!(p.confidence, 0.0);
        assert_eq!(det.window().len(), 1);
        assert_eq!(det.window().iter().next(), Some(&WindowEntry::Absent));
    }

    #[test]
    fn mostly_gaps_then_one_hand_is_sentinel() {
        let fake = Arc::new(FixedClassifier::new(SEQUENCE_LENGTH, SEQUENCE_FEATURES, vec![1.0, 0.0, 0.0]));
        let mut script = vec![None; SEQUENCE_LENGTH - 1];
        script.push(Some(open_hand(0.0)));
        let mut det = GestureDetector::new(
            Box::new(ScriptedLandmarker::scripted(script, None)),
            Box::new(Shared(fake.clone())),
            labels(),
        )
        .unwrap();

        let mut last = Prediction::new(Some("x".into()), 1.0);
        for _ in 0..SEQUENCE_LENGTH {
            last = det.predict(&Frame::new(8, 8)).unwrap();
        }
        assert_eq!(last, Prediction::none());
        assert_eq!(det.window().present_count(), 1);
        assert!(fake.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn detected_hand_is_encoded_as_sixty_three_values() {
        let fake = Arc::new(FixedClassifier::new(SEQUENCE_LENGTH, SEQUENCE_FEATURES, vec![0.0, 0.0, 1.0]));
        let hand = open_hand(0.1);
        let mut det = GestureDetector::new(
            Box::new(ScriptedLandmarker::always(hand.clone())),
            Box::new(Shared(fake.clone())),
            labels(),
        )
        .unwrap();
        let mut last = Prediction::none();
        for _ in 0..SEQUENCE_LENGTH {
            last = det.predict(&Frame::new(8, 8)).unwrap();
        }
        assert_eq!(last.label.as_deref(), Some("yes"));
        let seen = fake.seen.lock().unwrap();
        assert_eq!(&seen[0][..SEQUENCE_FEATURES], hand.to_sequence_features().as_slice());
    }

    #[test]
    fn unmapped_index_is_sentinel() {
        let (mut det, _) = detector(vec![0.0, 0.0, 0.0, 0.9]);
        let mut last = None;
        for _ in 0..SEQUENCE_LENGTH {
            last = Some(det.observe(present(1.0)).unwrap());
        }
        assert_eq!(last, Some(Prediction::none()));
    }

    #[test]
    fn reset_returns_to_filling() {
        let (mut det, _) = detector(vec![1.0, 0.0, 0.0]);
        for _ in 0..SEQUENCE_LENGTH {
            det.observe(present(1.0)).unwrap();
        }
        assert_eq!(det.state(), DetectorState::Ready);
        det.reset();
        assert_eq!(det.state(), DetectorState::Filling);
        assert!(det.window().is_empty());
        assert_eq!(det.observe(present(1.0)).unwrap(), Prediction::none());
    }

    #[test]
    fn incompatible_model_shape_is_rejected_up_front() {
        let bad_steps = FixedClassifier::new(10, SEQUENCE_FEATURES, vec![1.0]);
        assert!(GestureDetector::new(Box::new(ScriptedLandmarker::empty()), Box::new(bad_steps), labels()).is_err());

        let bad_features = FixedClassifier::new(SEQUENCE_LENGTH, 42, vec![1.0]);
        assert!(GestureDetector::new(Box::new(ScriptedLandmarker::empty()), Box::new(bad_features), labels()).is_err());

        let mut any_length = FixedClassifier::new(SEQUENCE_LENGTH, SEQUENCE_FEATURES, vec![1.0]);
        any_length.shape.0 = None;
        assert!(GestureDetector::new(Box::new(ScriptedLandmarker::empty()), Box::new(any_length), labels()).is_ok());
    }

    #[test]
    fn label_map_reads_json_array() {
        let dir = scratch_dir("gesture-labels");
        let path = dir.join("label_map.json");
        fs::write(&path, r#"["hello", "thanks"]"#).unwrap();
        let map = load_label_map(&path).unwrap();
        assert_eq!(map.get(1), Some("thanks"));
        assert_eq!(map.get(2), None);

        fs::write(&path, r#"{"hello": 0}"#).unwrap();
        assert!(load_label_map(&path).is_err());
        assert!(load_label_map(&dir.join("missing.json")).is_err());
    }
}
