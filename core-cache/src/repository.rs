//! # Cache Repositories
//!
//! Durable storage for per-item cache state and platform task mappings.
//!
//! ## Overview
//!
//! - [`CacheItemRepository`]: read/write of filename, task id, duration and
//!   queue membership, plus the eviction candidate query
//! - [`TaskMappingRepository`]: platform transfer id to item associations
//!
//! [`SqliteCacheRepository`] implements both on one pool. Dates are unix
//! seconds.

use crate::error::{CacheError, Result};
use crate::models::{CacheableItem, ItemId, TaskIdMapping};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Traits
// ============================================================================

/// Repository trait for cacheable item state
#[async_trait]
pub trait CacheItemRepository: Send + Sync {
    /// Find an item by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_id(&self, id: &ItemId) -> Result<Option<CacheableItem>>;

    /// Find the item whose outstanding transfer has `task_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_transfer_task_id(&self, task_id: &str) -> Result<Option<CacheableItem>>;

    /// Insert an item, or refresh its feed-owned fields if it exists
    ///
    /// On conflict only `locator`, `pinned`, `finished_at` and
    /// `published_at` are updated. Cache state and queue membership belong
    /// to the engine and are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn upsert(&self, item: &CacheableItem) -> Result<()>;

    /// Set or clear the outstanding transfer id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error.
    /// Setting a task id on a cached item violates the state constraint.
    async fn set_transfer_task_id(&self, id: &ItemId, task_id: Option<&str>) -> Result<()>;

    /// Set or clear the cached filename
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error
    async fn set_cached_filename(&self, id: &ItemId, filename: Option<&str>) -> Result<()>;

    /// Persist the validated duration
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error
    async fn set_duration(&self, id: &ItemId, duration_ms: Option<u64>) -> Result<()>;

    /// Mirror playback queue membership
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error
    async fn set_queued(&self, id: &ItemId, queued: bool) -> Result<()>;

    /// Mark the item finished (or unfinished) by the listener
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error
    async fn set_finished_at(&self, id: &ItemId, finished_at: Option<i64>) -> Result<()>;

    /// Pin or unpin an item
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item doesn't exist, or a database error
    async fn set_pinned(&self, id: &ItemId, pinned: bool) -> Result<()>;

    /// All items that are cached and not queued
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_eviction_candidates(&self) -> Result<Vec<CacheableItem>>;

    /// All cached items
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_cached(&self) -> Result<Vec<CacheableItem>>;

    /// All items with an outstanding transfer id
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_downloading(&self) -> Result<Vec<CacheableItem>>;

    /// All items whose durable `queued` flag is set
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_queued(&self) -> Result<Vec<CacheableItem>>;

    /// Number of items whose cached filename is `filename`
    ///
    /// Items sharing a locator share one cached file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn count_by_cached_filename(&self, filename: &str) -> Result<u64>;
}

/// Repository trait for platform transfer id mappings
#[async_trait]
pub trait TaskMappingRepository: Send + Sync {
    /// Insert a mapping, replacing any existing one for the same platform id
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn upsert_mapping(&self, mapping: &TaskIdMapping) -> Result<()>;

    /// Find the mapping for a platform transfer id
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_mapping(&self, platform_task_id: &str) -> Result<Option<TaskIdMapping>>;

    /// Delete a mapping; returns whether one existed
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn delete_mapping(&self, platform_task_id: &str) -> Result<bool>;

    /// All mappings, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn list_mappings(&self) -> Result<Vec<TaskIdMapping>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of the cache repositories
#[derive(Clone)]
pub struct SqliteCacheRepository {
    pool: SqlitePool,
}

impl SqliteCacheRepository {
    /// Create a new SQLite cache repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensure the schema exists.
    pub async fn initialize(&self) -> Result<()> {
        crate::db::run_migrations(&self.pool).await
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn ensure_updated(result: sqlx::sqlite::SqliteQueryResult, id: &ItemId) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(CacheError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Database row representation of a cacheable item
#[derive(Debug, FromRow)]
struct CacheItemRow {
    id: String,
    locator: String,
    cached_filename: Option<String>,
    transfer_task_id: Option<String>,
    duration_ms: Option<i64>,
    queued: bool,
    pinned: bool,
    finished_at: Option<i64>,
    published_at: i64,
}

impl TryFrom<CacheItemRow> for CacheableItem {
    type Error = CacheError;

    fn try_from(row: CacheItemRow) -> Result<Self> {
        let duration_ms = row
            .duration_ms
            .map(|ms| {
                u64::try_from(ms)
                    .map_err(|_| CacheError::Database(format!("Invalid duration_ms: {}", ms)))
            })
            .transpose()?;

        Ok(CacheableItem {
            id: ItemId(row.id),
            locator: row.locator,
            cached_filename: row.cached_filename,
            transfer_task_id: row.transfer_task_id,
            duration_ms,
            queued: row.queued,
            pinned: row.pinned,
            finished_at: row.finished_at,
            published_at: row.published_at,
        })
    }
}

/// Database row representation of a task mapping
#[derive(Debug, FromRow)]
struct TaskMappingRow {
    platform_task_id: String,
    item_id: String,
    locator: String,
    created_at: i64,
}

impl From<TaskMappingRow> for TaskIdMapping {
    fn from(row: TaskMappingRow) -> Self {
        TaskIdMapping {
            platform_task_id: row.platform_task_id,
            item_id: ItemId(row.item_id),
            locator: row.locator,
            created_at: row.created_at,
        }
    }
}

const ITEM_COLUMNS: &str = "id, locator, cached_filename, transfer_task_id, duration_ms, \
                            queued, pinned, finished_at, published_at";

#[async_trait]
impl CacheItemRepository for SqliteCacheRepository {
    async fn find_by_id(&self, id: &ItemId) -> Result<Option<CacheableItem>> {
        let row = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items WHERE id = ?",
            ITEM_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        row.map(CacheableItem::try_from).transpose()
    }

    async fn find_by_transfer_task_id(&self, task_id: &str) -> Result<Option<CacheableItem>> {
        let row = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items WHERE transfer_task_id = ? LIMIT 1",
            ITEM_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        row.map(CacheableItem::try_from).transpose()
    }

    async fn upsert(&self, item: &CacheableItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_items (
                id, locator, cached_filename, transfer_task_id, duration_ms,
                queued, pinned, finished_at, published_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                locator = excluded.locator,
                pinned = excluded.pinned,
                finished_at = excluded.finished_at,
                published_at = excluded.published_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.locator)
        .bind(&item.cached_filename)
        .bind(&item.transfer_task_id)
        .bind(item.duration_ms.map(|ms| ms as i64))
        .bind(item.queued)
        .bind(item.pinned)
        .bind(item.finished_at)
        .bind(item.published_at)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_transfer_task_id(&self, id: &ItemId, task_id: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET transfer_task_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(task_id)
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn set_cached_filename(&self, id: &ItemId, filename: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET cached_filename = ?, updated_at = ? WHERE id = ?",
        )
        .bind(filename)
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn set_duration(&self, id: &ItemId, duration_ms: Option<u64>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET duration_ms = ?, updated_at = ? WHERE id = ?",
        )
        .bind(duration_ms.map(|ms| ms as i64))
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn set_queued(&self, id: &ItemId, queued: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET queued = ?, updated_at = ? WHERE id = ?",
        )
        .bind(queued)
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn set_finished_at(&self, id: &ItemId, finished_at: Option<i64>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET finished_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(finished_at)
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn set_pinned(&self, id: &ItemId, pinned: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_items SET pinned = ?, updated_at = ? WHERE id = ?",
        )
        .bind(pinned)
        .bind(now_secs())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        ensure_updated(result, id)
    }

    async fn find_eviction_candidates(&self) -> Result<Vec<CacheableItem>> {
        let rows = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items \
             WHERE cached_filename IS NOT NULL AND queued = 0 \
             ORDER BY published_at ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        rows.into_iter().map(CacheableItem::try_from).collect()
    }

    async fn find_cached(&self) -> Result<Vec<CacheableItem>> {
        let rows = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items WHERE cached_filename IS NOT NULL ORDER BY id ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        rows.into_iter().map(CacheableItem::try_from).collect()
    }

    async fn find_downloading(&self) -> Result<Vec<CacheableItem>> {
        let rows = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items WHERE transfer_task_id IS NOT NULL ORDER BY id ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        rows.into_iter().map(CacheableItem::try_from).collect()
    }

    async fn find_queued(&self) -> Result<Vec<CacheableItem>> {
        let rows = sqlx::query_as::<_, CacheItemRow>(&format!(
            "SELECT {} FROM cache_items WHERE queued = 1 ORDER BY id ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        rows.into_iter().map(CacheableItem::try_from).collect()
    }

    async fn count_by_cached_filename(&self, filename: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM cache_items WHERE cached_filename = ?",
        )
        .bind(filename)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl TaskMappingRepository for SqliteCacheRepository {
    async fn upsert_mapping(&self, mapping: &TaskIdMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_task_mappings (platform_task_id, item_id, locator, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(platform_task_id) DO UPDATE SET
                item_id = excluded.item_id,
                locator = excluded.locator,
                created_at = excluded.created_at
            "#,
        )
        .bind(&mapping.platform_task_id)
        .bind(mapping.item_id.as_str())
        .bind(&mapping.locator)
        .bind(mapping.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_mapping(&self, platform_task_id: &str) -> Result<Option<TaskIdMapping>> {
        let row = sqlx::query_as::<_, TaskMappingRow>(
            r#"
            SELECT platform_task_id, item_id, locator, created_at
            FROM transfer_task_mappings
            WHERE platform_task_id = ?
            "#,
        )
        .bind(platform_task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(row.map(TaskIdMapping::from))
    }

    async fn delete_mapping(&self, platform_task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfer_task_mappings WHERE platform_task_id = ?")
            .bind(platform_task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_mappings(&self) -> Result<Vec<TaskIdMapping>> {
        let rows = sqlx::query_as::<_, TaskMappingRow>(
            r#"
            SELECT platform_task_id, item_id, locator, created_at
            FROM transfer_task_mappings
            ORDER BY created_at ASC, platform_task_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(TaskIdMapping::from).collect())
    }
}
