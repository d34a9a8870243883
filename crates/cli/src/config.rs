//! Configuration persistence for the vit-tune CLI.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/vit-tune/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Path to a JSON file with `VitConfig` hyperparameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,

    /// Input resolution override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<usize>,

    /// Label count override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,

    /// Data type for model weights (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Images per benchmark batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Batches per benchmark run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_batches: Option<usize>,

    /// Comma-separated GPU ids, e.g. "0,1".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<String>,

    /// Random seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Process-group backend (tcp, nccl).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_backend: Option<String>,

    /// Rendezvous endpoint (env:// or tcp://host:port).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_url: Option<String>,
}

impl ToolConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vit-tune").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// A missing or unreadable file yields the defaults.
    pub fn load() -> Self {
        Self::default_path()
            .map(|path| Self::load_or_default(&path))
            .unwrap_or_default()
    }

    /// Load configuration from `path`, falling back to the defaults.
    ///
    /// A missing file is silent; any other failure is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &ToolConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.model_config, &other.model_config);
        take(&mut self.image_size, &other.image_size);
        take(&mut self.num_classes, &other.num_classes);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.batch_size, &other.batch_size);
        take(&mut self.num_batches, &other.num_batches);
        take(&mut self.gpus, &other.gpus);
        take(&mut self.seed, &other.seed);
        take(&mut self.dist_backend, &other.dist_backend);
        take(&mut self.dist_url, &other.dist_url);
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error parsing TOML.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Error serializing to TOML.
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// No config directory available.
    #[error("No config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = ToolConfig {
            model_config: Some(PathBuf::from("/models/deit_small.json")),
            image_size: Some(384),
            gpus: Some("0,1".to_string()),
            seed: Some(7),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = ToolConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unset_fields_are_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        ToolConfig {
            batch_size: Some(64),
            ..Default::default()
        }
        .save_to(&path)
        .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), "batch_size = 64");
    }

    #[test]
    fn test_merge() {
        let mut base = ToolConfig {
            dtype: Some("f32".to_string()),
            batch_size: Some(32),
            ..Default::default()
        };

        let override_config = ToolConfig {
            batch_size: Some(128),
            dist_url: Some("tcp://10.0.0.1:23456".to_string()),
            ..Default::default()
        };

        base.merge(&override_config);

        assert_eq!(base.dtype, Some("f32".to_string())); // Unchanged
        assert_eq!(base.batch_size, Some(128)); // Overridden
        assert_eq!(base.dist_url, Some("tcp://10.0.0.1:23456".to_string())); // Added
    }

    #[test]
    fn test_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "batch_size = \"many\"").unwrap();
        assert!(matches!(
            ToolConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "seed = [not toml").unwrap();
        assert_eq!(ToolConfig::load_or_default(&path), ToolConfig::default());
        assert_eq!(
            ToolConfig::load_or_default(&dir.path().join("absent.toml")),
            ToolConfig::default()
        );

        fs::write(&path, "seed = 11").unwrap();
        assert_eq!(ToolConfig::load_or_default(&path).seed, Some(11));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ToolConfig::load_from(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
