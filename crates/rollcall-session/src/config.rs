use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
}

/// Session configuration.
///
/// Defaults match the attendance kiosk: match at 60% similarity, keep the
/// 10 most recent enrollments, 128-dimensional embeddings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Cosine similarity required for a check-in match.
    pub match_threshold: f32,
    /// Maximum number of enrolled records kept; oldest are evicted first.
    pub capacity: usize,
    /// Similarity at which a new enrollment counts as another person's face.
    pub duplicate_threshold: f32,
    /// Refuse enrollments that duplicate another identity's face.
    pub reject_duplicates: bool,
    /// Required embedding length at enrollment; 0 accepts any length.
    pub expected_dim: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("enrollments.db"),
            match_threshold: 0.6,
            capacity: rollcall_core::DEFAULT_CAPACITY,
            duplicate_threshold: 0.9,
            reject_duplicates: true,
            expected_dim: 128,
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        Self {
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", defaults.match_threshold),
            capacity: env_usize("ROLLCALL_CAPACITY", defaults.capacity),
            duplicate_threshold: env_f32(
                "ROLLCALL_DUPLICATE_THRESHOLD",
                defaults.duplicate_threshold,
            ),
            reject_duplicates: std::env::var("ROLLCALL_REJECT_DUPLICATES")
                .map(|v| v != "0")
                .unwrap_or(defaults.reject_duplicates),
            expected_dim: env_usize("ROLLCALL_EXPECTED_DIM", defaults.expected_dim),
        }
    }

    /// Parse configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Reject thresholds outside [0, 1] (NaN included).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("duplicate_threshold", self.duplicate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        Ok(())
    }

    /// Embedding length enforced at enrollment, if any.
    pub fn expected_dim(&self) -> Option<usize> {
        (self.expected_dim > 0).then_some(self.expected_dim)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.capacity, 10);
        assert_eq!(config.expected_dim(), Some(128));
        assert!(config.db_path.ends_with("rollcall/enrollments.db"));
    }

    #[test]
    fn test_toml_overrides_and_defaults() {
        let config = Config::from_toml_str(
            r#"
            db_path = "/var/lib/rollcall/faces.db"
            match_threshold = 0.75
            capacity = 200
            expected_dim = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/faces.db"));
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.capacity, 200);
        assert_eq!(config.expected_dim(), None);
        assert_eq!(config.duplicate_threshold, 0.9);
        assert!(config.reject_duplicates);
    }

    #[test]
    fn test_toml_rejects_out_of_range_threshold() {
        let err = Config::from_toml_str("match_threshold = 1.5").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ThresholdOutOfRange { name: "match_threshold", .. }
        ));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let config = Config {
            duplicate_threshold: f32::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rejects_bad_types() {
        assert!(matches!(
            Config::from_toml_str("capacity = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "reject_duplicates = false\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(!config.reject_duplicates);

        let missing = Config::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
