//! Ephemeral per-item download progress.
//!
//! `Some(fraction)` means a transfer is outstanding, `None` means it is not.
//! Nothing here is persisted; after a restart adoption re-creates the entries.

use crate::models::ItemId;
use core_async::sync::watch;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<ItemId, watch::Sender<Option<f64>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the item as downloading. Returns false if it already was.
    pub fn try_begin(&self, item: &ItemId) -> bool {
        let mut entries = self.entries.lock();
        let sender = entries
            .entry(item.clone())
            .or_insert_with(|| watch::channel(None).0);

        if sender.borrow().is_some() {
            return false;
        }
        sender.send_replace(Some(0.0));
        true
    }

    /// Publish a new fraction for a downloading item.
    ///
    /// Returns the whole percentage when it changed, so callers can throttle
    /// their own notifications. Updates for items that are not downloading
    /// are dropped.
    pub fn update(&self, item: &ItemId, fraction: f64) -> Option<u8> {
        let fraction = fraction.clamp(0.0, 1.0);
        let entries = self.entries.lock();
        let sender = entries.get(item)?;
        let previous = (*sender.borrow())?;

        sender.send_replace(Some(fraction));

        let before = whole_percent(previous);
        let after = whole_percent(fraction);
        (after != before).then_some(after)
    }

    /// Clear the downloading state. Returns whether it was set.
    ///
    /// The entry is dropped once nobody watches it.
    pub fn finish(&self, item: &ItemId) -> bool {
        let mut entries = self.entries.lock();
        let (was_downloading, unobserved) = match entries.get(item) {
            Some(sender) => (
                sender.send_replace(None).is_some(),
                sender.receiver_count() == 0,
            ),
            None => return false,
        };
        if unobserved {
            entries.remove(item);
        }
        was_downloading
    }

    pub fn is_downloading(&self, item: &ItemId) -> bool {
        self.fraction(item).is_some()
    }

    pub fn fraction(&self, item: &ItemId) -> Option<f64> {
        self.entries
            .lock()
            .get(item)
            .and_then(|sender| *sender.borrow())
    }

    /// Observe the item's progress. Works before any transfer has started.
    pub fn watch(&self, item: &ItemId) -> watch::Receiver<Option<f64>> {
        let mut entries = self.entries.lock();
        // Idle entries whose watchers have all gone.
        entries.retain(|_, sender| sender.borrow().is_some() || sender.receiver_count() > 0);
        entries
            .entry(item.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Items currently downloading.
    pub fn downloading(&self) -> Vec<ItemId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, sender)| sender.borrow().is_some())
            .map(|(item, _)| item.clone())
            .collect()
    }
}

#[cfg(test)]
impl ProgressTracker {
    fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

fn whole_percent(fraction: f64) -> u8 {
    (fraction * 100.0).floor() as u8
}
