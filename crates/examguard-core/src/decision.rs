//! Per-face tagging and frame-level status fusion for verification.

use crate::lbph::Prediction;
use serde::{Deserialize, Serialize};

/// Who a detected face was judged to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceTag {
    User,
    Intruder,
}

/// Aggregate verdict for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Exactly one face, and it is the expected user.
    Safe,
    /// Nothing conclusive, typically no face in view.
    Warning,
    /// Someone other than (or in addition to) the expected user.
    Intruder,
}

/// Tag one face. It is the user only when the classifier's label resolves
/// to the expected user and the distance is strictly below `threshold`.
/// A failed prediction counts as infinitely far.
pub fn tag_face(
    prediction: Option<&Prediction>,
    resolves_to_expected: bool,
    threshold: f64,
) -> (FaceTag, f64) {
    let distance = prediction.map(|p| p.distance).unwrap_or(f64::INFINITY);
    if resolves_to_expected && distance < threshold {
        (FaceTag::User, distance)
    } else {
        (FaceTag::Intruder, distance)
    }
}

/// Fuse per-face tags into the frame status.
pub fn aggregate(tags: &[FaceTag]) -> SessionStatus {
    match tags {
        [] => SessionStatus::Warning,
        [FaceTag::User] => SessionStatus::Safe,
        _ if tags.len() > 1 || tags.contains(&FaceTag::Intruder) => SessionStatus::Intruder,
        _ => SessionStatus::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(distance: f64) -> Prediction {
        Prediction { label: 0, distance }
    }

    #[test]
    fn test_no_faces_is_warning() {
        assert_eq!(aggregate(&[]), SessionStatus::Warning);
    }

    #[test]
    fn test_single_user_is_safe() {
        assert_eq!(aggregate(&[FaceTag::User]), SessionStatus::Safe);
    }

    #[test]
    fn test_single_intruder() {
        assert_eq!(aggregate(&[FaceTag::Intruder]), SessionStatus::Intruder);
    }

    #[test]
    fn test_two_faces_always_intruder() {
        assert_eq!(aggregate(&[FaceTag::User, FaceTag::User]), SessionStatus::Intruder);
        assert_eq!(aggregate(&[FaceTag::User, FaceTag::Intruder]), SessionStatus::Intruder);
    }

    #[test]
    fn test_tag_requires_label_and_distance() {
        assert_eq!(tag_face(Some(&pred(10.0)), true, 65.0).0, FaceTag::User);
        assert_eq!(tag_face(Some(&pred(10.0)), false, 65.0).0, FaceTag::Intruder);
        assert_eq!(tag_face(Some(&pred(80.0)), true, 65.0).0, FaceTag::Intruder);
    }

    #[test]
    fn test_tag_threshold_is_strict() {
        assert_eq!(tag_face(Some(&pred(65.0)), true, 65.0).0, FaceTag::Intruder);
    }

    #[test]
    fn test_failed_prediction_is_intruder() {
        let (tag, distance) = tag_face(None, true, 65.0);
        assert_eq!(tag, FaceTag::Intruder);
        assert!(distance.is_infinite());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SessionStatus::Intruder).unwrap(), "\"intruder\"");
        assert_eq!(serde_json::to_string(&FaceTag::User).unwrap(), "\"user\"");
    }
}
