//! Per-item serialization of cache state transitions.
//!
//! The orchestrator and the purger both move items between cached and
//! not-cached. Each holds the item's lock across the whole transition so a
//! concurrent reader never sees a half-applied one.

use crate::models::ItemId;
use core_async::sync::{Mutex, OwnedMutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ItemLocks {
    locks: parking_lot::Mutex<HashMap<ItemId, Arc<Mutex<()>>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `item`.
    pub async fn acquire(&self, item: &ItemId) -> ItemGuard {
        let lock = {
            let mut locks = self.locks.lock();
            // Drop entries nobody holds so the map tracks only live items.
            if locks.len() > 256 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(item.clone()).or_default())
        };

        ItemGuard {
            _guard: lock.lock_owned().await,
        }
    }
}

/// Held for the duration of one item transition.
pub struct ItemGuard {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_async::time::{timeout, Duration};

    #[core_async::test]
    async fn test_same_item_is_exclusive() {
        let locks = Arc::new(ItemLocks::new());
        let item = ItemId::from("ep-1");

        let guard = locks.acquire(&item).await;
        let blocked = timeout(Duration::from_millis(50), locks.acquire(&item)).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired = timeout(Duration::from_millis(50), locks.acquire(&item)).await;
        assert!(reacquired.is_ok());
    }

    #[core_async::test]
    async fn test_distinct_items_do_not_contend() {
        let locks = ItemLocks::new();
        let _a = locks.acquire(&ItemId::from("a")).await;
        let b = timeout(Duration::from_millis(50), locks.acquire(&ItemId::from("b"))).await;
        assert!(b.is_ok());
    }
}
