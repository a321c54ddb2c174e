//! # Core Configuration Module
//!
//! Provides the injected host capabilities for the episode cache core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds every bridge the engine talks to. It enforces fail-fast
//! validation so a missing capability is reported at startup, not on the first
//! download.
//!
//! ## Required Dependencies
//!
//! - `FileSystemAccess` - stat/move/delete/list in the cache directory
//! - `TransferClient` or `BackgroundTransferSession` - at least one way to fetch bytes
//!
//! ## Optional Dependencies
//!
//! - `BackgroundExecutor` - periodic purge scheduling; without it purges only run on demand
//! - `PlaybackMonitor` - defaults to "nothing is playing"
//! - `Clock` - defaults to the system clock
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for
//! the file system, transfer client and executor are injected automatically
//! if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/episodes.db")
//!     .cache_root("/path/to/cache")
//!     .file_system(Arc::new(MyFileSystem))
//!     .transfer_client(Arc::new(MyTransferClient))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    BackgroundExecutor, BackgroundTransferSession, Clock, FileSystemAccess, NothingPlaying,
    PlaybackMonitor, SystemClock, TransferClient,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Core configuration for the episode cache.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Root directory for cache and staging folders.
    ///
    /// `None` defers to [`FileSystemAccess::get_cache_directory`].
    pub cache_root: Option<PathBuf>,

    /// File system access abstraction (required)
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Foreground transfer client
    pub transfer_client: Option<Arc<dyn TransferClient>>,

    /// Background-capable transfer session
    pub background_session: Option<Arc<dyn BackgroundTransferSession>>,

    /// Deferred task executor
    pub background_executor: Option<Arc<dyn BackgroundExecutor>>,

    /// "Is this item open in the player?" predicate
    pub playback_monitor: Arc<dyn PlaybackMonitor>,

    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("cache_root", &self.cache_root)
            .field("file_system", &"FileSystemAccess { ... }")
            .field(
                "transfer_client",
                &self.transfer_client.as_ref().map(|_| "TransferClient { ... }"),
            )
            .field(
                "background_session",
                &self
                    .background_session
                    .as_ref()
                    .map(|_| "BackgroundTransferSession { ... }"),
            )
            .field(
                "background_executor",
                &self
                    .background_executor
                    .as_ref()
                    .map(|_| "BackgroundExecutor { ... }"),
            )
            .field("playback_monitor", &"PlaybackMonitor { ... }")
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Cache root, when given, is not empty
    /// - At least one transfer mechanism is available
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if let Some(root) = &self.cache_root {
            if root.as_os_str().is_empty() {
                return Err(Error::Config("Cache root cannot be empty".to_string()));
            }
        }

        if self.transfer_client.is_none() && self.background_session.is_none() {
            return Err(transfer_missing_error());
        }

        Ok(())
    }

    /// Whether periodic purge scheduling is possible.
    pub fn supports_scheduled_purge(&self) -> bool {
        self.background_executor.is_some()
    }
}

fn transfer_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "TransferClient".to_string(),
        message: "A TransferClient or BackgroundTransferSession is required to fetch episodes. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use ReqwestTransferClient. \
                 Mobile: inject the platform background session adapter."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn file_system_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for the cache directory. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use TokioFileSystem. \
                 Mobile: inject the sandboxed file system adapter."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(cache_root: Option<&PathBuf>) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs = match cache_root {
        Some(root) => TokioFileSystem::with_cache_directory(root.clone()),
        None => TokioFileSystem::new(),
    };
    Ok(Arc::new(fs))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(
    _cache_root: Option<&PathBuf>,
) -> Result<Arc<dyn FileSystemAccess>> {
    Err(file_system_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_transfer_client() -> Option<Arc<dyn TransferClient>> {
    use bridge_desktop::ReqwestTransferClient;

    Some(Arc::new(ReqwestTransferClient::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_transfer_client() -> Option<Arc<dyn TransferClient>> {
    None
}

#[cfg(feature = "desktop-shims")]
fn provide_default_executor() -> Option<Arc<dyn BackgroundExecutor>> {
    use bridge_desktop::TokioBackgroundExecutor;

    Some(Arc::new(TokioBackgroundExecutor::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_executor() -> Option<Arc<dyn BackgroundExecutor>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    cache_root: Option<PathBuf>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    transfer_client: Option<Arc<dyn TransferClient>>,
    background_session: Option<Arc<dyn BackgroundTransferSession>>,
    background_executor: Option<Arc<dyn BackgroundExecutor>>,
    playback_monitor: Option<Arc<dyn PlaybackMonitor>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/path/to/episodes.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the directory under which the cache and staging folders live.
    pub fn cache_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_root = Some(path.into());
        self
    }

    /// Sets the file system access implementation.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the foreground transfer client.
    pub fn transfer_client(mut self, client: Arc<dyn TransferClient>) -> Self {
        self.transfer_client = Some(client);
        self
    }

    /// Sets the background-capable transfer session.
    pub fn background_session(mut self, session: Arc<dyn BackgroundTransferSession>) -> Self {
        self.background_session = Some(session);
        self
    }

    /// Sets the deferred task executor used for periodic purges.
    pub fn background_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.background_executor = Some(executor);
        self
    }

    /// Sets the playback predicate consulted before evictions.
    pub fn playback_monitor(mut self, monitor: Arc<dyn PlaybackMonitor>) -> Self {
        self.playback_monitor = Some(monitor);
        self
    }

    /// Sets the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(CoreConfig)` on success, or an error if:
    /// - The database path is missing
    /// - A required bridge is missing and no desktop default exists
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(self.cache_root.as_ref())?,
        };

        let transfer_client = match self.transfer_client {
            Some(client) => Some(client),
            None => provide_default_transfer_client(),
        };

        let background_executor = match self.background_executor {
            Some(executor) => Some(executor),
            None => provide_default_executor(),
        };

        let config = CoreConfig {
            database_path,
            cache_root: self.cache_root,
            file_system,
            transfer_client,
            background_session: self.background_session,
            background_executor,
            playback_monitor: self
                .playback_monitor
                .unwrap_or_else(|| Arc::new(NothingPlaying)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::storage::FileMetadata;
    use bridge_traits::transfer::{TransferEventSink, TransferProgress};
    use core_async::sync::mpsc;
    use std::path::Path;

    struct MockFileSystem;

    #[async_trait]
    impl FileSystemAccess for MockFileSystem {
        async fn get_cache_directory(&self) -> BridgeResult<PathBuf> {
            Ok(PathBuf::from("/cache"))
        }

        async fn exists(&self, _path: &Path) -> BridgeResult<bool> {
            Ok(false)
        }

        async fn metadata(&self, _path: &Path) -> BridgeResult<FileMetadata> {
            Ok(FileMetadata {
                size: 0,
                created_at: None,
                modified_at: None,
                is_directory: false,
            })
        }

        async fn create_dir_all(&self, _path: &Path) -> BridgeResult<()> {
            Ok(())
        }

        async fn move_file(&self, _from: &Path, _to: &Path) -> BridgeResult<()> {
            Ok(())
        }

        async fn delete_file(&self, _path: &Path) -> BridgeResult<()> {
            Ok(())
        }

        async fn list_directory(&self, _path: &Path) -> BridgeResult<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    struct MockTransferClient;

    #[async_trait]
    impl TransferClient for MockTransferClient {
        async fn fetch(
            &self,
            _locator: &str,
            _destination: &Path,
            _progress: mpsc::UnboundedSender<TransferProgress>,
        ) -> BridgeResult<u64> {
            Ok(0)
        }
    }

    struct MockSession;

    #[async_trait]
    impl BackgroundTransferSession for MockSession {
        fn session_id(&self) -> String {
            "session".to_string()
        }

        async fn attach(&self, _sink: Arc<dyn TransferEventSink>) -> BridgeResult<()> {
            Ok(())
        }

        async fn submit_transfer(&self, _locator: &str) -> BridgeResult<String> {
            Ok("bg-1".to_string())
        }

        async fn cancel_transfer(&self, _task_id: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn list_outstanding(&self) -> BridgeResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn base_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .database_path("/db/episodes.db")
            .file_system(Arc::new(MockFileSystem))
    }

    #[test]
    fn test_builder_requires_database_path() {
        let result = CoreConfig::builder()
            .file_system(Arc::new(MockFileSystem))
            .transfer_client(Arc::new(MockTransferClient))
            .build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Database path is required"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_file_system() {
        let result = CoreConfig::builder()
            .database_path("/db/episodes.db")
            .transfer_client(Arc::new(MockTransferClient))
            .build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("FileSystemAccess"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_a_transfer_mechanism() {
        let result = base_builder().build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Capability missing"));
        assert!(err_msg.contains("TransferClient"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_defaults_fill_transfer_and_executor() {
        let config = base_builder().build().unwrap();
        assert!(config.transfer_client.is_some());
        assert!(config.supports_scheduled_purge());
    }

    #[test]
    fn test_background_session_alone_is_enough() {
        let config = base_builder()
            .background_session(Arc::new(MockSession))
            .build()
            .unwrap();

        assert!(config.background_session.is_some());
    }

    #[test]
    fn test_defaults_for_optional_bridges() {
        let config = base_builder()
            .transfer_client(Arc::new(MockTransferClient))
            .build()
            .unwrap();

        assert!(!config.playback_monitor.is_open_for_playback("ep-1"));
        assert!(config.clock.unix_timestamp() > 0);
        assert_eq!(config.cache_root, None);
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let result = CoreConfig::builder()
            .database_path("")
            .file_system(Arc::new(MockFileSystem))
            .transfer_client(Arc::new(MockTransferClient))
            .build();
        assert!(result.unwrap_err().to_string().contains("Database path"));

        let result = base_builder()
            .cache_root("")
            .transfer_client(Arc::new(MockTransferClient))
            .build();
        assert!(result.unwrap_err().to_string().contains("Cache root"));
    }

    #[test]
    fn test_config_debug_hides_bridges() {
        let config = base_builder()
            .cache_root("/cache")
            .transfer_client(Arc::new(MockTransferClient))
            .build()
            .unwrap();

        let rendered = format!("{:?}", config);
        assert!(rendered.contains("episodes.db"));
        assert!(rendered.contains("TransferClient { ... }"));
    }
}
