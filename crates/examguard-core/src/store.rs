//! Sample Store: one directory of normalized face crops per user.
//!
//! Layout: `<root>/<user_id>/<user_id>_<seq:04>.png`. Files are written
//! once and never rewritten; removal is an external concern.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SAMPLE_EXTENSION: &str = "png";
const READABLE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const MAX_USER_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write sample {path}: {source}")]
    Write {
        path: String,
        source: image::ImageError,
    },
}

/// Crop `face` out of `frame` and resize it to `size` × `size`.
///
/// Idempotent: a crop that already has the target size is returned as is.
pub fn normalize_face(frame: &GrayImage, face: &BoundingBox, size: u32) -> GrayImage {
    let crop = imageops::crop_imm(frame, face.x, face.y, face.width, face.height).to_image();
    normalize_sample(crop, size)
}

/// Resize a stored or freshly cropped sample to `size` × `size`.
pub fn normalize_sample(sample: GrayImage, size: u32) -> GrayImage {
    if sample.dimensions() == (size, size) {
        return sample;
    }
    imageops::resize(&sample, size, size, FilterType::Triangle)
}

/// Reject ids that could escape the dataset root or confuse the filesystem.
pub fn validate_user_id(user_id: &str) -> Result<(), StoreError> {
    let ok = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id != "."
        && user_id != ".."
        && !user_id.starts_with('.')
        && !user_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidUserId(user_id.to_string()))
    }
}

/// Per-user directory tree of face samples on durable storage.
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    /// Open (creating if needed) the dataset root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        validate_user_id(user_id)?;
        Ok(self.root.join(user_id))
    }

    /// Append samples for `user_id`, numbering after the highest existing
    /// sequence. Returns the number of samples on disk afterwards.
    ///
    /// Callers serialize appends per user.
    pub fn append(&self, user_id: &str, samples: &[GrayImage]) -> Result<usize, StoreError> {
        let dir = self.user_dir(user_id)?;
        std::fs::create_dir_all(&dir)?;

        let mut seq = self.last_sequence(user_id)?;
        for sample in samples {
            seq += 1;
            let path = dir.join(format!("{user_id}_{seq:04}.{SAMPLE_EXTENSION}"));
            sample.save(&path).map_err(|source| StoreError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }

        let total = self.count(user_id)?;
        tracing::debug!(user = user_id, added = samples.len(), total, "store: samples appended");
        Ok(total)
    }

    /// Number of sample files for `user_id` (0 for unknown users).
    pub fn count(&self, user_id: &str) -> Result<usize, StoreError> {
        Ok(self.sample_paths(user_id)?.len())
    }

    /// Users with at least one sample, sorted by id.
    pub fn users(&self) -> Result<Vec<String>, StoreError> {
        let mut users = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_user_id(&name).is_err() {
                continue;
            }
            if self.count(&name)? > 0 {
                users.push(name);
            }
        }
        users.sort();
        Ok(users)
    }

    /// Load every sample for `user_id`, normalized to `size` × `size`.
    /// Unreadable files are skipped with a warning.
    pub fn load(&self, user_id: &str, size: u32) -> Result<Vec<GrayImage>, StoreError> {
        let mut samples = Vec::new();
        for path in self.sample_paths(user_id)? {
            match image::open(&path) {
                Ok(img) => samples.push(normalize_sample(img.to_luma8(), size)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }
        Ok(samples)
    }

    /// Sample file paths for `user_id`, sorted by name.
    fn sample_paths(&self, user_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.user_dir(user_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_sample_file(p))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Highest `<seq>` in `<user>_<seq>.*` names, 0 when there is none.
    fn last_sequence(&self, user_id: &str) -> Result<u32, StoreError> {
        let prefix = format!("{user_id}_");
        let last = self
            .sample_paths(user_id)?
            .iter()
            .filter_map(|p| p.file_stem()?.to_str()?.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(last)
    }
}

fn is_sample_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| READABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x + y) % 256) as u8]))
    }

    #[test]
    fn test_normalize_face_size() {
        let frame = gradient(640, 480);
        let face = BoundingBox::new(100, 50, 150, 150);
        let sample = normalize_face(&frame, &face, 200);
        assert_eq!(sample.dimensions(), (200, 200));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let frame = gradient(640, 480);
        let once = normalize_face(&frame, &BoundingBox::new(10, 10, 300, 300), 200);
        let twice = normalize_sample(once.clone(), 200);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("user-42@exam").is_ok());
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden", "a\nb"] {
            assert!(validate_user_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_append_roundtrip_keeps_face_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        let frame = gradient(640, 480);
        let sample = normalize_face(&frame, &BoundingBox::new(40, 40, 220, 220), 200);

        assert_eq!(store.append("alice", &[sample.clone()]).unwrap(), 1);

        let loaded = store.load("alice", 200).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].dimensions(), (200, 200));
        assert_eq!(loaded[0], sample);
    }

    #[test]
    fn test_append_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        let sample = gradient(200, 200);

        store.append("bob", &[sample.clone(), sample.clone()]).unwrap();
        assert_eq!(store.append("bob", &[sample]).unwrap(), 3);
        assert!(dir.path().join("bob/bob_0003.png").is_file());
    }

    #[test]
    fn test_users_sorted_and_non_empty_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        let sample = gradient(200, 200);
        store.append("zed", &[sample.clone()]).unwrap();
        store.append("amy", &[sample]).unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(store.users().unwrap(), vec!["amy".to_string(), "zed".to_string()]);
    }

    #[test]
    fn test_load_resizes_foreign_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        std::fs::create_dir(dir.path().join("carol")).unwrap();
        gradient(64, 48).save(dir.path().join("carol/carol_0001.png")).unwrap();
        std::fs::write(dir.path().join("carol/carol_0002.jpg"), b"not an image").unwrap();

        let loaded = store.load("carol", 200).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].dimensions(), (200, 200));
    }

    #[test]
    fn test_count_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        assert_eq!(store.count("nobody").unwrap(), 0);
    }
}
