//! Persistent defaults for the `adaption-prompt` tool.
//!
//! Values are resolved in this order:
//! 1. command line flags
//! 2. config file (~/.config/adaption-prompt/config.toml)
//! 3. built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_ADAPTER_LEN: usize = 10;
pub const DEFAULT_ADAPTER_LAYERS: usize = 30;
pub const DEFAULT_DTYPE: &str = "auto";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Adapter tokens per adapted layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_len: Option<usize>,

    /// Number of adapted layers, counted from the top.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_layers: Option<usize>,

    /// Weight dtype (auto, bf16, fp16, fp32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Log level used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("adaption-prompt").join("config.toml"))
    }

    /// Load from the default path; a missing or unreadable file yields defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Overwrite fields that are set in `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.adapter_len.is_some() {
            self.adapter_len = other.adapter_len;
        }
        if other.adapter_layers.is_some() {
            self.adapter_layers = other.adapter_layers;
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    pub fn adapter_len(&self) -> usize {
        self.adapter_len.unwrap_or(DEFAULT_ADAPTER_LEN)
    }

    pub fn adapter_layers(&self) -> usize {
        self.adapter_layers.unwrap_or(DEFAULT_ADAPTER_LAYERS)
    }

    pub fn dtype(&self) -> &str {
        self.dtype.as_deref().unwrap_or(DEFAULT_DTYPE)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = CliConfig {
            adapter_len: Some(8),
            dtype: Some("bf16".to_string()),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("adapter_layers"));
    }

    #[test]
    fn test_merge() {
        let mut base = CliConfig {
            adapter_len: Some(10),
            adapter_layers: Some(30),
            ..Default::default()
        };
        let flags = CliConfig {
            adapter_layers: Some(4),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        base.merge(&flags);

        assert_eq!(base.adapter_len, Some(10));
        assert_eq!(base.adapter_layers, Some(4));
        assert_eq!(base.log_level.as_deref(), Some("debug"));
        assert_eq!(base.dtype(), DEFAULT_DTYPE);
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.adapter_len(), DEFAULT_ADAPTER_LEN);
        assert_eq!(config.adapter_layers(), DEFAULT_ADAPTER_LAYERS);
    }

    #[test]
    fn test_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "adapter_len = \"ten\"").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
