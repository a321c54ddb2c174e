//! Dropping an item's claim on its cached file.
//!
//! Items that share a locator share one file under the cache directory. The
//! file is only deleted once no row references it any more.

use crate::config::CacheLayout;
use crate::error::{CacheError, Result};
use crate::models::ItemId;
use crate::repository::CacheItemRepository;
use bridge_traits::storage::FileSystemAccess;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// No other item referenced the file; it is gone
    Deleted,
    /// Another item still points at the file
    Shared,
}

/// Clear `id`'s cached filename, then delete the file if it is unreferenced.
///
/// The row is cleared first so that, of two items released concurrently,
/// the later one always sees zero holders. A failed delete leaves an
/// unreferenced file behind, never a filename without a file.
pub(crate) async fn release_cached_file(
    items: &dyn CacheItemRepository,
    file_system: &dyn FileSystemAccess,
    layout: &CacheLayout,
    id: &ItemId,
    filename: &str,
) -> Result<Release> {
    items.set_cached_filename(id, None).await?;

    let holders = items.count_by_cached_filename(filename).await?;
    if holders > 0 {
        debug!(item_id = %id, filename, holders, "Cached file still referenced; keeping it");
        return Ok(Release::Shared);
    }

    let path = layout.cached_path(filename);
    if let Err(err) = file_system.delete_file(&path).await {
        if !err.is_not_found() {
            return Err(CacheError::file_system("Failed to delete cached file", err));
        }
    }
    Ok(Release::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::CacheableItem;
    use crate::repository::SqliteCacheRepository;
    use bridge_desktop::TokioFileSystem;

    async fn setup() -> (tempfile::TempDir, SqliteCacheRepository, TokioFileSystem, CacheLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("cache"), dir.path().join("staging"));
        std::fs::create_dir_all(&layout.cache_dir).unwrap();
        let repo = SqliteCacheRepository::new(create_test_pool().await.unwrap());
        let fs = TokioFileSystem::with_cache_directory(dir.path().to_path_buf());
        (dir, repo, fs, layout)
    }

    async fn cached(repo: &SqliteCacheRepository, id: &str, filename: &str) -> ItemId {
        let item = CacheableItem::new(id, "https://cdn.example.com/feed/shared.mp3", 1);
        repo.upsert(&item).await.unwrap();
        repo.set_cached_filename(&item.id, Some(filename)).await.unwrap();
        item.id
    }

    #[core_async::test]
    async fn test_last_holder_deletes_the_file() {
        let (_dir, repo, fs, layout) = setup().await;
        let path = layout.cached_path("shared.mp3");
        std::fs::write(&path, b"episode").unwrap();
        let a = cached(&repo, "a", "shared.mp3").await;
        let b = cached(&repo, "b", "shared.mp3").await;

        let first = release_cached_file(&repo, &fs, &layout, &a, "shared.mp3")
            .await
            .unwrap();
        assert_eq!(first, Release::Shared);
        assert!(path.exists());
        assert!(repo.find_by_id(&a).await.unwrap().unwrap().cached_filename.is_none());

        let second = release_cached_file(&repo, &fs, &layout, &b, "shared.mp3")
            .await
            .unwrap();
        assert_eq!(second, Release::Deleted);
        assert!(!path.exists());
    }

    #[core_async::test]
    async fn test_missing_file_still_clears_the_row() {
        let (_dir, repo, fs, layout) = setup().await;
        let a = cached(&repo, "a", "gone.mp3").await;

        let release = release_cached_file(&repo, &fs, &layout, &a, "gone.mp3")
            .await
            .unwrap();
        assert_eq!(release, Release::Deleted);
        assert!(repo.find_by_id(&a).await.unwrap().unwrap().cached_filename.is_none());
    }
}
