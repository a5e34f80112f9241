//! # bvault-config
//!
//! Configuration loading for blobvault.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. `~/.blobvault/config.toml`
//! 3. Environment variables (`BLOBVAULT_STORAGE_ROOT`,
//!    `BLOBVAULT_CHUNK_SIZE`, `BLOBVAULT_WORKERS`)
//!
//! CLI flags override all of these, but that is the binary's business;
//! this crate only produces a [`Config`] value.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default worker pool size per upload.
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the sharded chunk store.
    pub root: PathBuf,
    /// Path of the JSON metadata file used by the CLI.
    pub metadata_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".blobvault");
        Self {
            root: base.join("chunks"),
            metadata_path: base.join("metadata.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes per chunk. Part of a blob's identity: the same bytes
    /// chunked at a different size form a different blob.
    pub chunk_size: usize,
    /// Worker threads per upload.
    pub workers: usize,
    /// Re-hash chunks on download to detect bit rot.
    pub verify_downloads: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            verify_downloads: false,
        }
    }
}

impl Config {
    /// Load config from the standard location with env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = match path {
            Some(ref p) if p.exists() => Self::load_from(p)?,
            _ => Config::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load config from a specific TOML file (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Standard config path: `~/.blobvault/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".blobvault/config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(root) = std::env::var("BLOBVAULT_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(size) = std::env::var("BLOBVAULT_CHUNK_SIZE") {
            self.upload.chunk_size =
                size.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "BLOBVAULT_CHUNK_SIZE".into(),
                    value: size,
                })?;
        }
        if let Ok(workers) = std::env::var("BLOBVAULT_WORKERS") {
            self.upload.workers =
                workers.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "BLOBVAULT_WORKERS".into(),
                    value: workers,
                })?;
        }
        Ok(())
    }
}
