//! # Event Bus System
//!
//! Provides an event-driven architecture for the episode cache core using
//! `tokio::sync::broadcast`. Hosts subscribe to observe downloads and purges
//! without polling the durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ Orchestrator ├────────────>│           │    subscribe   ┌────────────┐
//! └──────────────┘             │ EventBus  ├───────────────>│ Subscriber │
//! ┌──────────────┐    emit     │ (broadcast│                └────────────┘
//! │    Purger    ├────────────>│  channel) │
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
//!
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Download(DownloadEvent::Started {
//!         item_id: "ep-1".to_string(),
//!         task_id: "task-1".to_string(),
//!         background: false,
//!     }))
//!     .ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Progress events are emitted at most once per whole percent so a slow
//! subscriber lags on progress, never on terminal events in practice.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-item download lifecycle
    Download(DownloadEvent),
    /// Cache eviction runs
    Purge(PurgeEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Purge(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Purge(PurgeEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Download Events
// ============================================================================

/// Events describing a single item's path to the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// A transfer was started for the item.
    Started {
        item_id: String,
        /// Scheduler task id or platform transfer id.
        task_id: String,
        /// Whether the platform background session carries the transfer.
        background: bool,
    },
    /// Bytes arrived for a transfer with a known total.
    Progress {
        item_id: String,
        bytes_written: u64,
        bytes_expected: u64,
    },
    /// The payload was moved into the cache and validated.
    Completed {
        item_id: String,
        cached_filename: String,
        /// Playable duration, when the container reports one.
        duration_ms: Option<u64>,
    },
    /// The transfer or post-download validation failed.
    Failed { item_id: String, message: String },
    /// The in-flight transfer was cancelled.
    Cancelled { item_id: String },
    /// A cached file was removed outside a purge run.
    Evicted { item_id: String },
    /// A transfer that survived a restart was re-attached.
    Adopted { item_id: String, task_id: String },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Progress { .. } => "Download in progress",
            DownloadEvent::Completed { .. } => "Download cached",
            DownloadEvent::Failed { .. } => "Download failed",
            DownloadEvent::Cancelled { .. } => "Download cancelled",
            DownloadEvent::Evicted { .. } => "Cached item evicted",
            DownloadEvent::Adopted { .. } => "Background download adopted",
        }
    }

    /// Item this event concerns.
    pub fn item_id(&self) -> &str {
        match self {
            DownloadEvent::Started { item_id, .. }
            | DownloadEvent::Progress { item_id, .. }
            | DownloadEvent::Completed { item_id, .. }
            | DownloadEvent::Failed { item_id, .. }
            | DownloadEvent::Cancelled { item_id }
            | DownloadEvent::Evicted { item_id }
            | DownloadEvent::Adopted { item_id, .. } => item_id,
        }
    }
}

// ============================================================================
// Purge Events
// ============================================================================

/// Events emitted by cache purge runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PurgeEvent {
    /// Cache usage exceeded the budget and eviction began.
    Started { bytes_used: u64, bytes_to_free: u64 },
    /// One cached file was removed.
    ItemEvicted { item_id: String, bytes_freed: u64 },
    /// The run finished or was cancelled.
    Completed {
        items_evicted: u64,
        bytes_freed: u64,
        cancelled: bool,
    },
    /// Nothing to do or another run held the lock.
    Skipped { reason: String },
}

impl PurgeEvent {
    fn description(&self) -> &str {
        match self {
            PurgeEvent::Started { .. } => "Cache purge started",
            PurgeEvent::ItemEvicted { .. } => "Cache purge evicted an item",
            PurgeEvent::Completed { .. } => "Cache purge completed",
            PurgeEvent::Skipped { .. } => "Cache purge skipped",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
///
/// Cloning the bus clones the sender, so every clone publishes into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns an error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all future events.
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let purges = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Purge(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(item: &str) -> CoreEvent {
        CoreEvent::Download(DownloadEvent::Started {
            item_id: item.to_string(),
            task_id: format!("task-{}", item),
            background: false,
        })
    }

    #[core_async::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[core_async::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started("ep-1")).is_err());
    }

    #[core_async::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = started("ep-2");
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[core_async::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Purge(_)));

        bus.emit(started("ep-3")).ok();

        let purge = CoreEvent::Purge(PurgeEvent::Completed {
            items_evicted: 2,
            bytes_freed: 200,
            cancelled: false,
        });
        bus.emit(purge.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), purge);
        assert!(stream.try_recv().is_none());
    }

    #[core_async::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(started(&format!("ep-{}", i))).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
        assert!(sub.recv().await.is_ok());
    }

    #[test]
    fn test_severity_and_description() {
        let failed = CoreEvent::Download(DownloadEvent::Failed {
            item_id: "ep-1".into(),
            message: "timed out".into(),
        });
        assert_eq!(failed.severity(), EventSeverity::Warning);
        assert_eq!(failed.description(), "Download failed");

        let skipped = CoreEvent::Purge(PurgeEvent::Skipped {
            reason: "under budget".into(),
        });
        assert_eq!(skipped.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_download_event_item_id() {
        let event = DownloadEvent::Adopted {
            item_id: "ep-9".into(),
            task_id: "bg-1".into(),
        };
        assert_eq!(event.item_id(), "ep-9");
    }

    #[test]
    fn test_serialization_shape() {
        let event = CoreEvent::Download(DownloadEvent::Cancelled {
            item_id: "ep-4".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Download");
        assert_eq!(json["payload"]["event"], "Cancelled");
        assert_eq!(json["payload"]["item_id"], "ep-4");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
