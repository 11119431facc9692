use crate::types::{FeatureVector, LandmarkSet, FINGER_TIPS, INDEX_TIP, MIDDLE_MCP, NUM_LANDMARKS, THUMB_TIP, WRIST};

/// 21 relative (x, y) pairs + palm direction (2) + fingertip distances (5) + pinch (1).
pub const STATIC_FEATURES: usize = NUM_LANDMARKS * 2 + 2 + FINGER_TIPS.len() + 1; // 50

/// Encodes one hand into the letter classifier's feature layout.
pub fn encode_static_features(hand: &LandmarkSet) -> FeatureVector {
    let points = hand.points();
    let (min_x, max_x) = points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
    let (min_y, max_y) = points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));

    let mut feats = Vec::with_capacity(STATIC_FEATURES);

    // relative coords (42)
    for p in points {
        feats.push(p.x - min_x);
        feats.push(p.y - min_y);
    }

    // palm direction (2)
    let wrist = hand.point(WRIST);
    let middle_mcp = hand.point(MIDDLE_MCP);
    feats.push(middle_mcp.x - wrist.x);
    feats.push(middle_mcp.y - wrist.y);

    // fingertip distances to the bounding-box center (5)
    let cx = (min_x + max_x) / 2.0;
    let cy = (min_y + max_y) / 2.0;
    for &tip in &FINGER_TIPS {
        let p = hand.point(tip);
        feats.push(((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt());
    }

    // pinch (1)
    feats.push(hand.point(THUMB_TIP).planar_distance(&hand.point(INDEX_TIP)));

    FeatureVector::new(feats)
}
