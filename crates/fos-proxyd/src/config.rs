//! Daemon configuration
//!
//! Loaded from a TOML file; every field has a default, so an empty file
//! (or no file at all) is a valid configuration.
//!
//! ```toml
//! store_path = "fos-proxy.json"
//! log_level = "info"
//! request_timeout_secs = 30
//!
//! [helper]
//! program = "fos-local-helper"
//! args = []
//! ```

use fos_proxy::{DEFAULT_LOOKUP_URL, DEFAULT_PROBE_URL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Local helper launch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("fos-local-helper"),
            args: Vec::new(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// JSON store holding profiles, settings and session records
    pub store_path: PathBuf,
    /// Default log filter (overridden by `RUST_LOG` and `--log-level`)
    pub log_level: String,
    pub probe_url: String,
    pub lookup_url: String,
    /// Upper bound for any single HTTP request
    pub request_timeout_secs: u64,
    pub helper: HelperConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("fos-proxy.json"),
            log_level: "info".to_string(),
            probe_url: DEFAULT_PROBE_URL.to_string(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            request_timeout_secs: 30,
            helper: HelperConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
