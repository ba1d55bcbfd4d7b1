//! Engine configuration. Every threshold is a parameter, not a constant.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// SeetaFace detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Faces narrower or shorter than this (pixels) are discarded.
    pub min_face_size: u32,
    /// Cascade score a window must exceed to count as a face.
    pub score_thresh: f64,
    /// Image pyramid downscale step, in (0, 1).
    pub pyramid_scale_factor: f32,
    /// Sliding window step in pixels (both axes).
    pub slide_window_step: u32,
}

impl DetectorSettings {
    /// Settings for still photos and live verification frames.
    pub fn photo() -> Self {
        Self {
            min_face_size: 100,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }

    /// Settings for decoded video frames: smaller faces, finer pyramid.
    pub fn video() -> Self {
        Self {
            min_face_size: 80,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.9,
            slide_window_step: 4,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::photo()
    }
}

/// Local Binary Pattern Histogram parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 2,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentSettings {
    /// Keep every Nth decoded video frame.
    pub video_stride: usize,
    /// Stop collecting video samples at this many faces.
    pub target_samples: usize,
    /// Samples a user needs on disk before training runs.
    pub min_samples: usize,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            video_stride: 3,
            target_samples: 120,
            min_samples: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// LBPH chi-square distance a face must stay strictly below to match.
    pub verify_distance: f64,
    /// Cosine distance an embedding must stay strictly below to match.
    pub identify_embedding_distance: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            verify_distance: 65.0,
            identify_embedding_distance: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProctorConfig {
    /// One subdirectory of face crops per user.
    pub dataset_dir: PathBuf,
    /// Trained LBPH model file.
    pub classifier_model_path: PathBuf,
    /// SeetaFace frontal detector model (required).
    pub detector_model_path: PathBuf,
    /// ArcFace ONNX model; the embedding matcher is disabled when unset.
    pub embedding_model_path: Option<PathBuf>,
    /// Side length of the normalized square face crop.
    pub face_size: u32,
    pub detector: DetectorSettings,
    pub video_detector: DetectorSettings,
    pub lbph: LbphParams,
    pub enrollment: EnrollmentSettings,
    pub thresholds: Thresholds,
    pub preview_jpeg_quality: u8,
}

impl Default for ProctorConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            dataset_dir: data_dir.join("dataset"),
            classifier_model_path: data_dir.join("lbph-model.bin"),
            detector_model_path: default_model_dir().join("seeta_fd_frontal_v1.0.bin"),
            embedding_model_path: None,
            face_size: 200,
            detector: DetectorSettings::photo(),
            video_detector: DetectorSettings::video(),
            lbph: LbphParams::default(),
            enrollment: EnrollmentSettings::default(),
            thresholds: Thresholds::default(),
            preview_jpeg_quality: 85,
        }
    }
}

impl ProctorConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.face_size < 16 || self.face_size > 1024 {
            return Err(ConfigError::Invalid(format!(
                "face_size must be between 16 and 1024, got {}",
                self.face_size
            )));
        }
        for (name, d) in [("detector", &self.detector), ("video_detector", &self.video_detector)] {
            if !(d.pyramid_scale_factor > 0.0 && d.pyramid_scale_factor < 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.pyramid_scale_factor must be in (0, 1), got {}",
                    d.pyramid_scale_factor
                )));
            }
            if d.slide_window_step == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.slide_window_step must be positive"
                )));
            }
        }
        let p = &self.lbph;
        if p.radius == 0 || p.neighbors == 0 || p.neighbors > 16 || p.grid_x == 0 || p.grid_y == 0 {
            return Err(ConfigError::Invalid(format!(
                "lbph needs radius >= 1, 1 <= neighbors <= 16 and a non-empty grid, got {p:?}"
            )));
        }
        if 2 * p.radius + p.grid_x.max(p.grid_y) > self.face_size {
            return Err(ConfigError::Invalid(format!(
                "lbph grid {}x{} with radius {} does not fit a {}px face",
                p.grid_x, p.grid_y, p.radius, self.face_size
            )));
        }
        let e = &self.enrollment;
        if e.video_stride == 0 || e.target_samples == 0 || e.min_samples == 0 {
            return Err(ConfigError::Invalid(
                "enrollment stride, target and minimum must be positive".into(),
            ));
        }
        let t = &self.thresholds;
        if !(t.verify_distance > 0.0) || !(t.identify_embedding_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "thresholds must be positive, got {t:?}"
            )));
        }
        if self.preview_jpeg_quality == 0 || self.preview_jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "preview_jpeg_quality must be between 1 and 100, got {}",
                self.preview_jpeg_quality
            )));
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/examguard`, falling back to `~/.local/share/examguard`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("examguard")
}

/// Directory holding the detector and embedding model assets.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
