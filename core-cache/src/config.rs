//! Cache configuration and on-disk layout

use crate::error::{CacheError, Result};
use bridge_traits::storage::FileSystemAccess;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound accepted for the transfer concurrency limit.
pub const MAX_CONCURRENT_TRANSFERS_LIMIT: usize = 16;

/// Configuration for the episode cache engine.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache budget in bytes (default: 500MB)
    pub max_cache_size_bytes: u64,

    /// Number of concurrent foreground transfers (default: 6)
    pub max_concurrent_transfers: usize,

    /// Age after which an item becomes a preferred eviction candidate (default: 2 days)
    pub staleness_threshold: Duration,

    /// Cadence of scheduled purges (default: 6 hours)
    pub purge_interval: Duration,

    /// Extension used when the locator does not carry one (default: "mp3")
    pub default_extension: String,

    /// Cache directory, relative to the cache root unless absolute
    pub cache_directory: PathBuf,

    /// Directory holding in-flight and relocated payloads
    pub staging_directory: PathBuf,

    /// Route transfers through the platform background session
    pub background_transfers: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: 500 * 1024 * 1024, // 500MB
            max_concurrent_transfers: 6,
            staleness_threshold: Duration::from_secs(2 * 24 * 60 * 60),
            purge_interval: Duration::from_secs(6 * 60 * 60),
            default_extension: "mp3".to_string(),
            cache_directory: PathBuf::from("episode_cache"),
            staging_directory: PathBuf::from("transfer_staging"),
            background_transfers: false,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache budget.
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = bytes;
        self
    }

    /// Set the foreground transfer concurrency limit.
    pub fn with_max_concurrent_transfers(mut self, count: usize) -> Self {
        self.max_concurrent_transfers = count;
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Set the fallback filename extension. A leading dot is ignored.
    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = dir.into();
        self
    }

    pub fn with_staging_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_directory = dir.into();
        self
    }

    /// Prefer the platform background session over the in-process scheduler.
    pub fn with_background_transfers(mut self, enabled: bool) -> Self {
        self.background_transfers = enabled;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_cache_size_bytes must be greater than 0".to_string(),
            ));
        }

        if !(1..=MAX_CONCURRENT_TRANSFERS_LIMIT).contains(&self.max_concurrent_transfers) {
            return Err(CacheError::InvalidConfig(format!(
                "max_concurrent_transfers must be between 1 and {}",
                MAX_CONCURRENT_TRANSFERS_LIMIT
            )));
        }

        if self.purge_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "purge_interval must be greater than 0".to_string(),
            ));
        }

        if self.default_extension.is_empty()
            || !self
                .default_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(CacheError::InvalidConfig(
                "default_extension must be a non-empty alphanumeric string".to_string(),
            ));
        }

        if self.cache_directory.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig(
                "cache_directory cannot be empty".to_string(),
            ));
        }

        if self.staging_directory.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig(
                "staging_directory cannot be empty".to_string(),
            ));
        }

        if self.cache_directory == self.staging_directory {
            return Err(CacheError::InvalidConfig(
                "staging_directory must differ from cache_directory".to_string(),
            ));
        }

        Ok(())
    }
}

/// Resolved absolute directories used by the engine.
///
/// Cached filenames always resolve directly under `cache_dir`; the staging
/// directory is kept separate so purges never count partial payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            staging_dir: staging_dir.into(),
        }
    }

    /// Resolve the layout below `root`, or below the host cache directory
    /// when no root is given, and create both directories.
    pub async fn prepare(
        fs: &dyn FileSystemAccess,
        root: Option<&Path>,
        config: &CacheConfig,
    ) -> Result<Self> {
        let root = match root {
            Some(root) => root.to_path_buf(),
            None => fs.get_cache_directory().await?,
        };

        let layout = Self::new(
            root.join(&config.cache_directory),
            root.join(&config.staging_directory),
        );

        fs.create_dir_all(&layout.cache_dir).await?;
        fs.create_dir_all(&layout.staging_dir).await?;
        debug!(staging = ?layout.staging_dir, "Staging directory ready");
        info!("Episode cache directory at {:?}", layout.cache_dir);

        Ok(layout)
    }

    /// Absolute path of a cached filename.
    pub fn cached_path(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_cache_size_bytes, 500 * 1024 * 1024);
        assert_eq!(config.max_concurrent_transfers, 6);
        assert_eq!(config.staleness_threshold, Duration::from_secs(172_800));
        assert_eq!(config.purge_interval, Duration::from_secs(21_600));
        assert_eq!(config.default_extension, "mp3");
        assert!(!config.background_transfers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_max_cache_size(1024)
            .with_max_concurrent_transfers(2)
            .with_default_extension(".m4a")
            .with_background_transfers(true)
            .with_cache_directory("audio")
            .with_staging_directory("partial");

        assert_eq!(config.max_cache_size_bytes, 1024);
        assert_eq!(config.max_concurrent_transfers, 2);
        assert_eq!(config.default_extension, "m4a");
        assert!(config.background_transfers);
        assert_eq!(config.cache_directory, PathBuf::from("audio"));
        assert_eq!(config.staging_directory, PathBuf::from("partial"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default()
            .with_max_cache_size(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_max_concurrent_transfers(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_max_concurrent_transfers(17)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_max_concurrent_transfers(16)
            .validate()
            .is_ok());
        assert!(CacheConfig::default()
            .with_default_extension("mp 3")
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_staging_directory("episode_cache")
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_purge_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = CacheLayout::new("/tmp/root/cache", "/tmp/root/staging");
        assert_eq!(
            layout.cached_path("abc.mp3"),
            PathBuf::from("/tmp/root/cache/abc.mp3")
        );
    }
}
