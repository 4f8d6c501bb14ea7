//! Configuration module
//!
//! Handles loading and saving planewire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange settings
    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// Schema settings
    #[serde(default)]
    pub schema: SchemaConfig,
}

/// Tunables for request/reply and dump exchanges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Deadline for a single reply in ms
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Deadline for an entire dump stream in ms
    #[serde(default = "default_dump_timeout")]
    pub dump_timeout_ms: u64,
    /// Buffered detail items per dump stream
    #[serde(default = "default_stream_buffer")]
    pub dump_buffer: usize,
    /// Buffered events per subscriber
    #[serde(default = "default_stream_buffer")]
    pub event_buffer: usize,
    /// Maximum encoded payload size in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_reply_timeout() -> u64 {
    3_000
}

fn default_dump_timeout() -> u64 {
    10_000
}

fn default_stream_buffer() -> usize {
    64
}

fn default_max_payload() -> usize {
    1024 * 1024
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout(),
            dump_timeout_ms: default_dump_timeout(),
            dump_buffer: default_stream_buffer(),
            event_buffer: default_stream_buffer(),
            max_payload: default_max_payload(),
        }
    }
}

/// Where to find module definition files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Directory holding `.json` module definitions
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("planewire").join("config.toml"))
    }

    /// Load from the given path, or the default location, falling back
    /// to defaults when no file exists
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        match path {
            Some(p) if p.exists() => Self::load(&p).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}", p.display(), e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }
}
