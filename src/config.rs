//! Service Configuration
//!
//! Tunables for the executor, inode cache, downloads and write-back flushing.
//! Every field has a default, so a partial JSON file is enough to override
//! a single value.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default delay between the first write and the deferred upload
const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(4);

/// Environment override for the cache root
const ENV_CACHE_DIR: &str = "CLOUDMOUNT_CACHE_DIR";

/// Environment override for the flush delay, in milliseconds
const ENV_FLUSH_DELAY: &str = "CLOUDMOUNT_FLUSH_DELAY";

/// Duration fields are stored as whole milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Worker pool sizing for the task executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// How long an idle worker waits before it may exit
    #[serde(with = "millis")]
    pub idle_time: Duration,
    /// Upper bound on concurrent workers
    pub max_workers: usize,
    /// Workers kept alive even when idle
    pub min_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_secs(60),
            max_workers: 16,
            min_workers: 1,
        }
    }
}

/// Eviction policy for the inode cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeCacheConfig {
    /// Minimum time an inode stays cached after its last use.
    /// Zero disables the age gate.
    #[serde(with = "millis")]
    pub clean_age_threshold: Duration,
    /// How often the cleaner runs. Zero means never poll.
    #[serde(with = "millis")]
    pub clean_interval: Duration,
    /// Number of entries above which the cleaner evicts
    pub clean_size_threshold: usize,
}

impl Default for InodeCacheConfig {
    fn default() -> Self {
        Self {
            clean_age_threshold: Duration::from_secs(5 * 60),
            clean_interval: Duration::from_secs(5 * 60),
            clean_size_threshold: 512,
        }
    }
}

/// Partial download tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Smallest prefix handed to a reader before its range is complete
    pub min_chunk: u64,
    /// Minimum length of a newly started fetch
    pub readahead: u64,
    /// Retries for retryable transfer failures while fetching a whole file
    pub max_retries: u32,
    /// Pause between retries (multiplied by the attempt number)
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            min_chunk: 1 << 18,
            readahead: 1 << 20,
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding backing files and the database
    pub cache_dir: PathBuf,
    /// Delay from the first modification to the deferred upload
    #[serde(with = "millis")]
    pub flush_delay: Duration,
    pub executor: ExecutorConfig,
    pub inode_cache: InodeCacheConfig,
    pub download: DownloadConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("cloudmount");

        Self {
            cache_dir,
            flush_delay: DEFAULT_FLUSH_DELAY,
            executor: ExecutorConfig::default(),
            inode_cache: InodeCacheConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an optional JSON file, then apply environment overrides
    ///
    /// # Arguments
    /// * `path` - Configuration file; missing files fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `CLOUDMOUNT_*` environment overrides
    fn apply_env(&mut self) {
        if let Ok(dir) = env::var(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(dir);
        }

        if let Ok(delay) = env::var(ENV_FLUSH_DELAY) {
            match delay.parse::<u64>() {
                Ok(ms) => self.flush_delay = Duration::from_millis(ms),
                Err(e) => warn!(value = %delay, error = %e, "Ignoring invalid flush delay"),
            }
        }
    }

    /// Path of the persisted database inside the cache directory
    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join("cloudmount.json")
    }

    /// Directory holding backing files
    pub fn files_dir(&self) -> PathBuf {
        self.cache_dir.join("files")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{ "flush_delay": 50, "executor": { "max_workers": 2 } }"#)
                .unwrap();

        assert_eq!(config.flush_delay, Duration::from_millis(50));
        assert_eq!(config.executor.max_workers, 2);
        assert_eq!(config.executor.min_workers, 1);
        assert_eq!(config.download.min_chunk, 1 << 18);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.inode_cache, InodeCacheConfig::default());
    }
}
