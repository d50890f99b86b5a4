use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CACHE_DIR;
use crate::error::CacheError;

/// User-facing cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the metadata slot and downloaded payloads.
    pub cache_dir: PathBuf,
    /// Ceiling in bytes. When unset, the persisted (or default 2GB) ceiling is kept.
    pub max_size: Option<u64>,
    pub download_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(CACHE_DIR),
            max_size: None,
            download_timeout_secs: 10,
        }
    }
}

impl CacheConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, CacheError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
