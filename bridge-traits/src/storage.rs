//! File System Abstractions
//!
//! The cache engine only needs a narrow slice of file I/O: directory
//! resolution, stat, move, delete and listing. Payload bytes are written by
//! the transfer layer, never through this trait.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// Abstracts file operations to support different platforms:
/// - Desktop: Direct filesystem access
/// - iOS/Android: Sandboxed app directories
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn cache_root(fs: &dyn FileSystemAccess) -> Result<PathBuf> {
///     let root = fs.get_cache_directory().await?.join("episode_cache");
///     fs.create_dir_all(&root).await?;
///     Ok(root)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's cache directory
    ///
    /// Everything the engine stores lives below this directory.
    async fn get_cache_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Move a file, replacing nothing.
    ///
    /// Implementations must fail if `to` already exists. Callers that want
    /// to replace a file delete it first.
    async fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Sum the sizes of the immediate entries of a directory.
    ///
    /// Subdirectories are skipped, not descended into.
    async fn directory_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.list_directory(path).await? {
            let metadata = self.metadata(&entry).await?;
            if !metadata.is_directory {
                total = total.saturating_add(metadata.size);
            }
        }
        Ok(total)
    }
}
