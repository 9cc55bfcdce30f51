//! Configuration for memloom
//!
//! A single TOML document configures the data directory and logging:
//!
//! ```toml
//! data_dir = "/var/lib/memloom"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! Every field has a default, so an absent or empty config file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root of the on-disk state: chunk, adapter and model registries plus
    /// the operation log all live under this directory.
    pub data_dir: PathBuf,

    /// Logging configuration
    pub logging: LogConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            logging: LogConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Default data directory: `<platform data dir>/memloom`, or `./memloom-data`
/// when the platform directory cannot be resolved.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from("memloom-data"), |dir| dir.join("memloom"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_a_data_dir() {
        let config = CoreConfig::default();
        assert!(!config.data_dir.as_os_str().is_empty());
    }

    #[test]
    fn load_parses_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memloom.toml");
        std::fs::write(&path, "data_dir = \"/tmp/state\"\n[logging]\nlevel = \"warn\"\n")
            .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memloom.toml");
        std::fs::write(&path, "data_dir = [").unwrap();

        assert!(CoreConfig::load(&path).is_err());
    }
}
