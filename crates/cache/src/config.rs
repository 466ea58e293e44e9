//! Cache configuration for eviction age, worker cadence, and disk location.
//!
//! Configuration can be loaded from a file, environment variables, or
//! created programmatically with the builder methods.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tile_cache::CACHE_SECONDS;

/// Configuration for a [`crate::TileCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Age in seconds past which memory entries are evicted.
    pub cache_seconds: u64,
    /// How long the worker sleeps between eviction sweeps when idle.
    pub worker_tick: Duration,
    /// Disk tier root. `None` disables the disk tier until
    /// [`crate::TileCache::set_cache_directory`] is called.
    pub cache_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_seconds: CACHE_SECONDS,
            worker_tick: Duration::from_secs(1),
            cache_dir: None,
        }
    }
}

/// Errors from loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid value for {0}")]
    InvalidValue(String),
}

impl CacheConfig {
    /// Sets the memory eviction age in seconds.
    pub fn with_cache_seconds(mut self, seconds: u64) -> Self {
        self.cache_seconds = seconds;
        self
    }

    /// Sets the worker wake-up interval.
    ///
    /// Eviction sweeps run at least this often even when no tiles are
    /// being requested.
    pub fn with_worker_tick(mut self, tick: Duration) -> Self {
        self.worker_tick = tick;
        self
    }

    /// Sets the disk cache directory.
    pub fn with_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Returns the default tile directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/chartpad/tiles
    /// - Linux: ~/.cache/chartpad/tiles
    /// - Windows: %LOCALAPPDATA%\chartpad\tiles
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("chartpad").join("tiles")
        } else {
            PathBuf::from("cache/tiles")
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// - `CHARTPAD_CACHE_SECONDS`: memory eviction age in seconds
    /// - `CHARTPAD_WORKER_TICK_MS`: worker wake-up interval in milliseconds
    /// - `CHARTPAD_CACHE_DIR`: disk cache directory path
    ///
    /// # Errors
    /// Returns an error if a variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CHARTPAD_CACHE_SECONDS") {
            config.cache_seconds = val
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue("CHARTPAD_CACHE_SECONDS".to_string()))?;
        }

        if let Ok(val) = std::env::var("CHARTPAD_WORKER_TICK_MS") {
            let millis = val
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue("CHARTPAD_WORKER_TICK_MS".to_string()))?;
            config.worker_tick = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("CHARTPAD_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Loads configuration from a file of `key = value` lines.
    ///
    /// Expected format:
    /// ```toml
    /// cache_seconds = 30
    /// worker_tick_ms = 1000
    /// cache_dir = "/path/to/tiles"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a value fails to
    /// parse. Unknown keys are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                match key {
                    "cache_seconds" => {
                        config.cache_seconds = value
                            .parse::<u64>()
                            .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
                    }
                    "worker_tick_ms" => {
                        let millis = value
                            .parse::<u64>()
                            .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
                        config.worker_tick = Duration::from_millis(millis);
                    }
                    "cache_dir" => {
                        config.cache_dir = Some(PathBuf::from(value));
                    }
                    _ => {}
                }
            }
        }

        Ok(config)
    }
}
