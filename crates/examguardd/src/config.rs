use examguard_core::config::default_model_dir;
use examguard_core::ProctorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DETECTOR_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
const EMBEDDING_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration: an optional TOML file, overridden by
/// `EXAMGUARD_*` environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    #[serde(flatten)]
    pub proctor: ProctorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match var("EXAMGUARD_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        let p = &mut config.proctor;

        if let Some(dir) = var("EXAMGUARD_DATA_DIR").map(PathBuf::from) {
            p.dataset_dir = dir.join("dataset");
            p.classifier_model_path = dir.join("lbph-model.bin");
        }

        let model_dir = var("EXAMGUARD_MODEL_DIR").map(PathBuf::from);
        if let Some(dir) = &model_dir {
            p.detector_model_path = dir.join(DETECTOR_MODEL_FILE);
        }

        match var("EXAMGUARD_EMBEDDING_MODEL") {
            Some(path) if path.is_empty() => p.embedding_model_path = None,
            Some(path) => p.embedding_model_path = Some(PathBuf::from(path)),
            None if p.embedding_model_path.is_none() => {
                let candidate = model_dir
                    .unwrap_or_else(default_model_dir)
                    .join(EMBEDDING_MODEL_FILE);
                if candidate.exists() {
                    p.embedding_model_path = Some(candidate);
                }
            }
            None => {}
        }

        override_parsed(&var, "EXAMGUARD_VERIFY_THRESHOLD", &mut p.thresholds.verify_distance);
        override_parsed(
            &var,
            "EXAMGUARD_IDENTIFY_THRESHOLD",
            &mut p.thresholds.identify_embedding_distance,
        );
        override_parsed(&var, "EXAMGUARD_MIN_SAMPLES", &mut p.enrollment.min_samples);
        override_parsed(&var, "EXAMGUARD_TARGET_SAMPLES", &mut p.enrollment.target_samples);
        override_parsed(&var, "EXAMGUARD_VIDEO_STRIDE", &mut p.enrollment.video_stride);

        if let Some(v) = var("EXAMGUARD_SYSTEM_BUS") {
            config.system_bus = v != "0";
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(!config.system_bus);
        assert_eq!(config.proctor.thresholds.verify_distance, 65.0);
        assert_eq!(config.proctor.enrollment.min_samples, 30);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EXAMGUARD_DATA_DIR", "/srv/examguard"),
            ("EXAMGUARD_MODEL_DIR", "/opt/models"),
            ("EXAMGUARD_VERIFY_THRESHOLD", "50.5"),
            ("EXAMGUARD_MIN_SAMPLES", "10"),
            ("EXAMGUARD_VIDEO_STRIDE", "5"),
            ("EXAMGUARD_EMBEDDING_MODEL", "/opt/models/arcface.onnx"),
            ("EXAMGUARD_SYSTEM_BUS", "1"),
        ]))
        .unwrap();

        let p = &config.proctor;
        assert_eq!(p.dataset_dir, PathBuf::from("/srv/examguard/dataset"));
        assert_eq!(p.classifier_model_path, PathBuf::from("/srv/examguard/lbph-model.bin"));
        assert_eq!(p.detector_model_path, PathBuf::from("/opt/models/seeta_fd_frontal_v1.0.bin"));
        assert_eq!(p.embedding_model_path, Some(PathBuf::from("/opt/models/arcface.onnx")));
        assert_eq!(p.thresholds.verify_distance, 50.5);
        assert_eq!(p.enrollment.min_samples, 10);
        assert_eq!(p.enrollment.video_stride, 5);
        assert!(config.system_bus);
    }

    #[test]
    fn test_unparsable_override_keeps_default() {
        let config =
            Config::from_lookup(lookup(&[("EXAMGUARD_TARGET_SAMPLES", "lots")])).unwrap();
        assert_eq!(config.proctor.enrollment.target_samples, 120);
    }

    #[test]
    fn test_toml_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examguard.toml");
        std::fs::write(
            &path,
            r#"
system_bus = true
face_size = 160

[thresholds]
verify_distance = 70.0

[enrollment]
min_samples = 20
"#,
        )
        .unwrap();

        let config = Config::from_lookup(lookup(&[
            ("EXAMGUARD_CONFIG", path.to_str().unwrap()),
            ("EXAMGUARD_MIN_SAMPLES", "25"),
        ]))
        .unwrap();
        assert!(config.system_bus);
        assert_eq!(config.proctor.face_size, 160);
        assert_eq!(config.proctor.thresholds.verify_distance, 70.0);
        // unset fields in a partial table keep their defaults
        assert_eq!(config.proctor.enrollment.target_samples, 120);
        assert_eq!(config.proctor.enrollment.min_samples, 25);
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::from_lookup(lookup(&[("EXAMGUARD_CONFIG", "/nonexistent/examguard.toml")]));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_malformed_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "face_size = \"big\"").unwrap();
        let result = Config::from_lookup(lookup(&[("EXAMGUARD_CONFIG", path.to_str().unwrap())]));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
