//! Transfer configuration
//!
//! Loaded from `transfer.json` in the OxideTerm config directory
//! (~/.oxideterm on macOS/Linux, %APPDATA%\OxideTerm on Windows). A missing
//! file means defaults; out-of-range values are clamped when read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::transfer::retry::RetryConfig;
use crate::transfer::types::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_IO_TIMEOUT_SECS, DEFAULT_JOB_RETENTION_SECS, DEFAULT_WORKERS,
    MAX_CHUNK_SIZE, MAX_WORKERS, MIN_CHUNK_SIZE,
};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What to do when a copy destination already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Replace the existing file (last writer wins)
    #[default]
    Overwrite,
    /// Leave the existing file and count the item as done
    Skip,
    /// Fail the item
    Fail,
}

/// When a job that ran to the end is reported as `failed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Only when every item failed
    #[default]
    AllItemsFailed,
    /// As soon as one item failed
    AnyItemFailed,
}

impl FailurePolicy {
    pub fn is_failure(&self, failed: usize, total: usize) -> bool {
        match self {
            FailurePolicy::AllItemsFailed => total > 0 && failed >= total,
            FailurePolicy::AnyItemFailed => failed > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
    /// Concurrent items per job on multiplexing channels
    pub workers: usize,
    /// Bytes moved per read/write step
    pub chunk_size: usize,
    /// Per-operation channel timeout
    pub io_timeout_secs: u64,
    /// How long a finished job stays queryable
    pub job_retention_secs: u64,
    pub conflict_policy: ConflictPolicy,
    pub failure_policy: FailurePolicy,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            job_retention_secs: DEFAULT_JOB_RETENTION_SECS,
            conflict_policy: ConflictPolicy::default(),
            failure_policy: FailurePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Get the OxideTerm configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

impl TransferConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join("transfer.json"))
    }

    /// Load from `path`, falling back to defaults if the file doesn't exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path).await {
            Ok(contents) => {
                let config: TransferConfig = serde_json::from_str(&contents)?;
                tracing::debug!("Loaded transfer config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Load from [`TransferConfig::default_path`]
    pub async fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path()?).await
    }

    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}
