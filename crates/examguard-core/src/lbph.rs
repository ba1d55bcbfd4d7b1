//! Local Binary Pattern Histogram face classifier.
//!
//! Each face crop is turned into a circular LBP image, split into a grid of
//! cells, and described by the concatenation of per-cell normalized
//! histograms. Prediction is nearest neighbour over all training
//! histograms under the chi-square distance. One model covers every user;
//! it is rebuilt wholesale on each training pass and persisted with
//! `bincode`.

use crate::config::LbphParams;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const MODEL_FORMAT_VERSION: u32 = 1;
// Neighbour samples closer than this to the centre pixel count as equal.
const LBP_EPSILON: f32 = 1e-4;
const CHI_SQUARE_EPSILON: f32 = f32::EPSILON;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("no training samples")]
    NoSamples,
    #[error("face crop is {width}x{height}, too small for radius {radius} and a {grid_x}x{grid_y} grid")]
    CropTooSmall {
        width: u32,
        height: u32,
        radius: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("labels ({labels}) and samples ({samples}) differ in length")]
    LabelMismatch { labels: usize, samples: usize },
    #[error("model file is corrupt: {0}")]
    Corrupt(String),
    #[error("model format version {found}, expected {MODEL_FORMAT_VERSION}")]
    VersionMismatch { found: u32 },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Nearest training sample for a probe face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    /// Chi-square distance, lower = more similar.
    pub distance: f64,
}

/// A trained LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    format_version: u32,
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<i32>,
    /// User ids in label order at training time.
    users: Vec<String>,
    trained_at: String,
}

impl LbphModel {
    /// Fit a model on `(sample, label)` pairs. `users[label]` names the user
    /// behind each label.
    pub fn train(
        params: LbphParams,
        samples: &[GrayImage],
        labels: &[i32],
        users: Vec<String>,
    ) -> Result<Self, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::NoSamples);
        }
        if samples.len() != labels.len() {
            return Err(ClassifierError::LabelMismatch {
                labels: labels.len(),
                samples: samples.len(),
            });
        }

        let histograms = samples
            .iter()
            .map(|s| spatial_histogram(s, &params))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            format_version: MODEL_FORMAT_VERSION,
            params,
            histograms,
            labels: labels.to_vec(),
            users,
            trained_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Closest training sample to `face` by chi-square distance.
    pub fn predict(&self, face: &GrayImage) -> Result<Prediction, ClassifierError> {
        let query = spatial_histogram(face, &self.params)?;

        let mut best = Prediction {
            label: -1,
            distance: f64::INFINITY,
        };
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square(hist, &query);
            if distance < best.distance {
                best = Prediction { label, distance };
            }
        }

        if best.label < 0 {
            return Err(ClassifierError::NoSamples);
        }
        Ok(best)
    }

    /// User id behind `label` at training time.
    pub fn user_of(&self, label: i32) -> Option<&str> {
        usize::try_from(label)
            .ok()
            .and_then(|idx| self.users.get(idx))
            .map(String::as_str)
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    pub fn trained_at(&self) -> &str {
        &self.trained_at
    }

    /// Persist atomically: write `<path>.tmp`, sync, rename over `path`.
    /// A reader never observes a half-written model.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(self).map_err(|e| ClassifierError::Corrupt(e.to_string()))?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);

        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a model written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let bytes = std::fs::read(path)?;
        let model: LbphModel =
            bincode::deserialize(&bytes).map_err(|e| ClassifierError::Corrupt(e.to_string()))?;

        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(ClassifierError::VersionMismatch {
                found: model.format_version,
            });
        }
        if model.histograms.len() != model.labels.len() || model.histograms.is_empty() {
            return Err(ClassifierError::Corrupt(format!(
                "{} histograms for {} labels",
                model.histograms.len(),
                model.labels.len()
            )));
        }
        let expected = histogram_len(&model.params);
        if model.histograms.iter().any(|h| h.len() != expected) {
            return Err(ClassifierError::Corrupt(
                "histogram length does not match parameters".into(),
            ));
        }
        Ok(model)
    }
}

fn histogram_len(params: &LbphParams) -> usize {
    (1usize << params.neighbors) * (params.grid_x * params.grid_y) as usize
}

/// Circular LBP image: `(w - 2r) × (h - 2r)` codes, row-major.
///
/// Neighbour `n` sits at angle `2πn/P` on a circle of radius `r` and is
/// sampled bilinearly; bit `n` is set when the sample is not darker than
/// the centre pixel.
fn circular_lbp(src: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, u32, u32) {
    let (w, h) = src.dimensions();
    let out_w = w - 2 * radius;
    let out_h = h - 2 * radius;
    let mut codes = vec![0u32; (out_w * out_h) as usize];
    let r = radius as i64;
    let px = |x: i64, y: i64| src.get_pixel(x as u32, y as u32).0[0] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / neighbors as f64;
        let x = snap(radius as f64 * angle.cos());
        let y = snap(-(radius as f64) * angle.sin());

        let fx = x.floor() as i64;
        let fy = y.floor() as i64;
        let cx = x.ceil() as i64;
        let cy = y.ceil() as i64;
        let tx = (x - fx as f64) as f32;
        let ty = (y - fy as f64) as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..(h as i64 - r) {
            for j in r..(w as i64 - r) {
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let center = px(j, i);
                if t > center || (t - center).abs() < LBP_EPSILON {
                    let idx = ((i - r) * out_w as i64 + (j - r)) as usize;
                    codes[idx] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Round away trigonometric noise so axis-aligned neighbours sample exactly.
fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < 1e-9 { rounded } else { v }
}

/// Concatenated per-cell histograms, each cell normalized to sum 1.
fn spatial_histogram(src: &GrayImage, params: &LbphParams) -> Result<Vec<f32>, ClassifierError> {
    let (w, h) = src.dimensions();
    let too_small = || ClassifierError::CropTooSmall {
        width: w,
        height: h,
        radius: params.radius,
        grid_x: params.grid_x,
        grid_y: params.grid_y,
    };
    if w <= 2 * params.radius || h <= 2 * params.radius {
        return Err(too_small());
    }

    let (codes, lbp_w, lbp_h) = circular_lbp(src, params.radius, params.neighbors);
    let cell_w = lbp_w / params.grid_x;
    let cell_h = lbp_h / params.grid_y;
    if cell_w == 0 || cell_h == 0 {
        return Err(too_small());
    }

    let bins = 1usize << params.neighbors;
    let cell_pixels = (cell_w * cell_h) as f32;
    let mut hist = vec![0.0f32; histogram_len(params)];

    for gy in 0..params.grid_y {
        for gx in 0..params.grid_x {
            let offset = ((gy * params.grid_x + gx) as usize) * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                let row = (y * lbp_w) as usize;
                for x in gx * cell_w..(gx + 1) * cell_w {
                    let code = codes[row + x as usize] as usize;
                    hist[offset + code] += 1.0;
                }
            }
            for v in &mut hist[offset..offset + bins] {
                *v /= cell_pixels;
            }
        }
    }

    Ok(hist)
}

/// Symmetric chi-square distance: `Σ 2(a - b)² / (a + b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .filter(|(x, y)| *x + *y > CHI_SQUARE_EPSILON)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            2.0 * d * d / (x + y) as f64
        })
        .sum()
}
