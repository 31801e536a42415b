//! Engine configuration loaded from TOML.
//!
//! ```toml
//! map_name = "cratemap"
//! map_dir = "db"
//! run_time = 1700000000
//! debug_level = 1
//! benchmark = true
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings applied to a [`crate::DecodeEngine`] before initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Hardware map identifier; empty selects the process-wide default
    pub map_name: String,
    /// Directory holding `<map_name>.toml` map files
    pub map_dir: Option<PathBuf>,
    /// Run timestamp used to select the map period
    pub run_time: Option<u64>,
    pub debug_level: u32,
    pub benchmark: bool,
    pub data_version: Option<u32>,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
