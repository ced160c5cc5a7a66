use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::app_error::{SyncError, SyncResult};

const ENV_BASE_URL: &str = "PERSISTENT_SYNC_BASE_URL";
const ENV_STORAGE_PATH: &str = "PERSISTENT_SYNC_STORAGE_PATH";
const ENV_MAX_AGE_SECS: &str = "PERSISTENT_SYNC_MAX_AGE_SECS";

/// Settings shared by every component of a [`crate::sync_manager::SyncManager`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root URL of the remote service, without trailing slash.
    pub base_url: String,
    /// Directory of the LMDB environment backing the local cache.
    pub storage_path: PathBuf,
    /// Prefix of the derived storage name of each key.
    pub key_prefix: String,
    /// Entries written under another version read as absent.
    pub cache_version: u32,
    /// Freshness window. 24h unless configured otherwise.
    pub max_age_secs: u64,
    /// Period of the background reconciliation tick. `0` disables it.
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub map_size_mb: usize,
    pub initially_online: bool,
    /// Capacity of the broadcast channels carrying sync events.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            storage_path: PathBuf::from("persistent_sync.lmdb"),
            key_prefix: "persistent_".to_string(),
            cache_version: 1,
            max_age_secs: 24 * 60 * 60,
            refresh_interval_secs: 30,
            request_timeout_secs: 15,
            map_size_mb: 64,
            initially_online: true,
            event_buffer: 64,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> SyncResult<Self> {
        let config: SyncConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        info!("Loading sync configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies `PERSISTENT_SYNC_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> SyncResult<Self> {
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            debug!("{ENV_BASE_URL} overrides base_url");
            self.base_url = url;
        }
        if let Ok(path) = std::env::var(ENV_STORAGE_PATH) {
            debug!("{ENV_STORAGE_PATH} overrides storage_path");
            self.storage_path = PathBuf::from(path);
        }
        if let Ok(raw) = std::env::var(ENV_MAX_AGE_SECS) {
            self.max_age_secs = raw.trim().parse().map_err(|e| {
                SyncError::ConfigError(format!("{ENV_MAX_AGE_SECS} is not a number: {e}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::ConfigError("base_url must not be empty".to_string()));
        }
        if self.map_size_mb == 0 {
            return Err(SyncError::ConfigError("map_size_mb must be positive".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::ConfigError("event_buffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_age_millis(&self) -> i64 {
        i64::try_from(self.max_age().as_millis()).unwrap_or(i64::MAX)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn map_size_bytes(&self) -> usize {
        self.map_size_mb.saturating_mul(1024 * 1024)
    }
}
