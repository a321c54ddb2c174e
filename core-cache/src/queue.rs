//! Playback queue membership.
//!
//! The engine does not own queue ordering. It only watches which items are
//! present and reacts to items entering or leaving.

use crate::models::ItemId;
use core_async::sync::watch;
use std::collections::HashSet;

/// Items that entered and left the queue between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDelta {
    /// In the order they appear in the new snapshot
    pub added: Vec<ItemId>,
    /// In the order they appeared in the old snapshot
    pub removed: Vec<ItemId>,
}

impl QueueDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Symmetric difference of two queue snapshots. Reordering alone is no change.
pub fn diff_membership(previous: &[ItemId], next: &[ItemId]) -> QueueDelta {
    let before: HashSet<&ItemId> = previous.iter().collect();
    let after: HashSet<&ItemId> = next.iter().collect();

    let mut seen = HashSet::new();
    let added = next
        .iter()
        .filter(|item| !before.contains(item) && seen.insert(*item))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let removed = previous
        .iter()
        .filter(|item| !after.contains(item) && seen.insert(*item))
        .cloned()
        .collect();

    QueueDelta { added, removed }
}

/// Observable ordered queue of item ids.
///
/// Hosts that keep their own queue push snapshots with [`replace`].
///
/// [`replace`]: PlaybackQueue::replace
#[derive(Clone)]
pub struct PlaybackQueue {
    sender: watch::Sender<Vec<ItemId>>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Vec::new());
        Self { sender }
    }

    pub fn replace(&self, items: Vec<ItemId>) {
        self.sender.send_replace(items);
    }

    /// Append an item unless it is already queued.
    pub fn push(&self, item: ItemId) {
        self.sender.send_if_modified(|items| {
            if items.contains(&item) {
                return false;
            }
            items.push(item);
            true
        });
    }

    pub fn remove(&self, item: &ItemId) {
        self.sender.send_if_modified(|items| {
            let before = items.len();
            items.retain(|queued| queued != item);
            items.len() != before
        });
    }

    pub fn snapshot(&self) -> Vec<ItemId> {
        self.sender.borrow().clone()
    }

    pub fn contains(&self, item: &ItemId) -> bool {
        self.sender.borrow().contains(item)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ItemId>> {
        self.sender.subscribe()
    }
}
