//! Domain models for cacheable episodes and transfer bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a cacheable item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Durable record of an episode the engine may cache.
///
/// `cached_filename` and `transfer_task_id` are never both set: an item is
/// either downloading, cached, or neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheableItem {
    pub id: ItemId,
    /// Remote content reference, usually a media URL
    pub locator: String,
    /// Filename under the cache directory once cached
    pub cached_filename: Option<String>,
    /// Scheduler or platform task id while a transfer is outstanding
    pub transfer_task_id: Option<String>,
    pub duration_ms: Option<u64>,
    /// Whether the item is currently in the playback queue
    pub queued: bool,
    /// Pinned items are never evicted automatically
    pub pinned: bool,
    /// When the listener finished the episode (unix seconds)
    pub finished_at: Option<i64>,
    /// Publish date (unix seconds)
    pub published_at: i64,
}

impl CacheableItem {
    pub fn new(id: impl Into<ItemId>, locator: impl Into<String>, published_at: i64) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            cached_filename: None,
            transfer_task_id: None,
            duration_ms: None,
            queued: false,
            pinned: false,
            finished_at: None,
            published_at,
        }
    }

    pub fn with_queued(mut self, queued: bool) -> Self {
        self.queued = queued;
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn with_finished_at(mut self, finished_at: i64) -> Self {
        self.finished_at = Some(finished_at);
        self
    }

    pub fn with_cached_filename(mut self, filename: impl Into<String>) -> Self {
        self.cached_filename = Some(filename.into());
        self
    }

    pub fn is_cached(&self) -> bool {
        self.cached_filename.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Durable association between a platform transfer id and the item it feeds.
///
/// Lets the engine re-attach to background transfers after a restart.
/// Keyed by `platform_task_id`, so there is at most one live mapping per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdMapping {
    pub platform_task_id: String,
    pub item_id: ItemId,
    pub locator: String,
    pub created_at: i64,
}

impl TaskIdMapping {
    pub fn new(
        platform_task_id: impl Into<String>,
        item_id: ItemId,
        locator: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            platform_task_id: platform_task_id.into(),
            item_id,
            locator: locator.into(),
            created_at,
        }
    }
}

/// Observable cache state of a single item.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    NotCached,
    /// Transfer outstanding; the fraction is known once a total was reported.
    Downloading(Option<f64>),
    Cached(String),
}

impl CacheStatus {
    pub fn is_cached(&self) -> bool {
        matches!(self, CacheStatus::Cached(_))
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, CacheStatus::Downloading(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_builder() {
        let item = CacheableItem::new("ep-1", "https://cdn.example.com/ep1.mp3", 1_700_000_000)
            .with_queued(true)
            .with_pinned(true)
            .with_finished_at(1_700_100_000);

        assert_eq!(item.id, ItemId::from("ep-1"));
        assert!(item.queued);
        assert!(item.pinned);
        assert!(item.is_finished());
        assert!(!item.is_cached());
        assert!(item.transfer_task_id.is_none());
    }

    #[test]
    fn test_item_id_serializes_transparently() {
        let json = serde_json::to_string(&ItemId::new("ep-9")).unwrap();
        assert_eq!(json, "\"ep-9\"");
    }

    #[test]
    fn test_cache_status_predicates() {
        assert!(CacheStatus::Cached("a.mp3".into()).is_cached());
        assert!(CacheStatus::Downloading(None).is_downloading());
        assert!(!CacheStatus::NotCached.is_cached());
    }
}
