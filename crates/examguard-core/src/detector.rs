//! SeetaFace frontal face detector via `rustface`.
//!
//! A funnel-structured cascade over an image pyramid. Cheap enough to run on
//! every proctoring frame, deterministic for a given frame and settings.

use crate::config::DetectorSettings;
use crate::types::BoundingBox;
use image::GrayImage;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// rustface refuses smaller windows.
const SEETA_MIN_WINDOW: u32 = 20;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download seeta_fd_frontal_v1.0.bin and place it in models/")]
    ModelNotFound(String),
    #[error("failed to load detector model {path}: {reason}")]
    ModelLoad { path: String, reason: String },
}

/// Proposes face rectangles in a grayscale frame.
pub trait FaceDetector: Send + Sync {
    /// Rectangles sorted by descending score, clipped to the frame,
    /// at least `settings.min_face_size` on both sides.
    fn detect(&self, frame: &GrayImage, settings: &DetectorSettings) -> Vec<BoundingBox>;
}

/// SeetaFace-based face detector.
pub struct SeetaDetector {
    model: Mutex<rustface::Model>,
}

impl SeetaDetector {
    /// Load the SeetaFace model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        let display = model_path.display().to_string();
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(display));
        }

        let bytes = std::fs::read(model_path).map_err(|e| DetectorError::ModelLoad {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let model = rustface::read_model(Cursor::new(bytes)).map_err(|e| {
            DetectorError::ModelLoad {
                path: display.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace detector model");

        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl FaceDetector for SeetaDetector {
    fn detect(&self, frame: &GrayImage, settings: &DetectorSettings) -> Vec<BoundingBox> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let model = match self.model.lock() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(settings.min_face_size.max(SEETA_MIN_WINDOW));
        detector.set_score_thresh(settings.score_thresh);
        detector.set_pyramid_scale_factor(settings.pyramid_scale_factor);
        detector.set_slide_window_step(settings.slide_window_step, settings.slide_window_step);

        let faces = detector.detect(&rustface::ImageData::new(frame.as_raw(), width, height));

        let raw = faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                (bbox.x(), bbox.y(), bbox.width(), bbox.height(), face.score() as f32)
            })
            .collect();

        let result = filter_and_sort(raw, width, height, settings.min_face_size);
        tracing::debug!(faces = result.len(), width, height, "detector: frame processed");
        result
    }
}

/// Clip raw `(x, y, w, h, score)` detections to the frame, drop those under
/// `min_size`, and order by descending score, then top-left first.
fn filter_and_sort(
    raw: Vec<(i32, i32, u32, u32, f32)>,
    frame_width: u32,
    frame_height: u32,
    min_size: u32,
) -> Vec<BoundingBox> {
    let mut boxes: Vec<BoundingBox> = raw
        .into_iter()
        .filter_map(|(x, y, w, h, score)| {
            let (x, y, w, h) = BoundingBox::clamped(x, y, w, h, frame_width, frame_height)?;
            (w >= min_size && h >= min_size).then_some(BoundingBox {
                x,
                y,
                width: w,
                height: h,
                score,
            })
        })
        .collect();

    boxes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model() {
        let result = SeetaDetector::load(Path::new("/nonexistent/seeta_fd_frontal_v1.0.bin"));
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_load_corrupt_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeta.bin");
        std::fs::write(&path, b"xx").unwrap();
        let result = SeetaDetector::load(&path);
        assert!(matches!(result, Err(DetectorError::ModelLoad { .. })));
    }

    #[test]
    fn test_filter_drops_small_faces() {
        let raw = vec![(0, 0, 120, 120, 5.0), (200, 0, 60, 60, 9.0)];
        let boxes = filter_and_sort(raw, 640, 480, 100);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].width, 120);
    }

    #[test]
    fn test_filter_clips_to_frame() {
        // Hangs off the left edge: 150 - 30 = 120 wide after clipping
        let raw = vec![(-30, 10, 150, 150, 3.0)];
        let boxes = filter_and_sort(raw, 640, 480, 100);
        assert_eq!(boxes[0].x, 0);
        assert_eq!(boxes[0].width, 120);
    }

    #[test]
    fn test_filter_clipping_can_reject() {
        // Only 40px remain inside the frame
        let raw = vec![(600, 0, 150, 150, 3.0)];
        assert!(filter_and_sort(raw, 640, 480, 100).is_empty());
    }

    #[test]
    fn test_sort_by_score_then_position() {
        let raw = vec![
            (300, 100, 100, 100, 2.0),
            (10, 10, 100, 100, 4.0),
            (100, 100, 100, 100, 2.0),
        ];
        let boxes = filter_and_sort(raw, 640, 480, 100);
        assert_eq!(boxes[0].x, 10);
        assert_eq!(boxes[1].x, 100);
        assert_eq!(boxes[2].x, 300);
    }

    #[test]
    fn test_filter_is_deterministic() {
        let raw = vec![(5, 5, 110, 110, 1.0), (300, 200, 130, 130, 1.5)];
        let a = filter_and_sort(raw.clone(), 640, 480, 100);
        let b = filter_and_sort(raw, 640, 480, 100);
        assert_eq!(a, b);
    }
}
