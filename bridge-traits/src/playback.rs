//! Playback predicate consumed by the cache engine.
//!
//! The engine never plays anything. It only needs to know whether an item is
//! currently open in the host's player so it can refuse to evict it.

/// Reports which items the host player currently has open.
///
/// Implementations must be cheap and non-blocking; the purger calls this
/// once per eviction candidate.
pub trait PlaybackMonitor: Send + Sync {
    fn is_open_for_playback(&self, item_id: &str) -> bool;
}

/// Monitor for hosts without a player, e.g. headless sync agents.
#[derive(Debug, Clone, Copy, Default)]
pub struct NothingPlaying;

impl PlaybackMonitor for NothingPlaying {
    fn is_open_for_playback(&self, _item_id: &str) -> bool {
        false
    }
}
