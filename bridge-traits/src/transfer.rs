//! Network Transfer Abstractions
//!
//! Two transfer styles are supported:
//!
//! - [`TransferClient`]: a foreground fetch that runs inside the process and
//!   writes the payload to a caller-chosen path. The cache engine drives these
//!   through its bounded scheduler.
//! - [`BackgroundTransferSession`]: a platform facility (e.g. a background
//!   URL session) whose transfers outlive the process. Results come back
//!   through a [`TransferEventSink`] registered with [`attach`].
//!
//! [`attach`]: BackgroundTransferSession::attach

use async_trait::async_trait;
use core_async::sync::mpsc;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Progress report for a single in-flight fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    /// Total payload size when the server announced one.
    pub bytes_expected: Option<u64>,
}

impl TransferProgress {
    pub fn new(bytes_written: u64, bytes_expected: Option<u64>) -> Self {
        Self {
            bytes_written,
            bytes_expected,
        }
    }

    /// Completed fraction in `[0, 1]`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(total) if total > 0 => {
                Some((self.bytes_written as f64 / total as f64).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

/// Foreground transfer client.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::transfer::TransferClient;
/// use core_async::sync::mpsc;
///
/// async fn fetch(client: &dyn TransferClient, dest: &Path) -> Result<u64> {
///     let (tx, _rx) = mpsc::unbounded_channel();
///     client.fetch("https://example.com/ep1.mp3", dest, tx).await
/// }
/// ```
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Fetch `locator` into `destination`, returning the byte count written.
    ///
    /// Implementations report progress through `progress` and must not retry.
    /// A partially written `destination` may remain on error; the caller
    /// owns its cleanup.
    async fn fetch(
        &self,
        locator: &str,
        destination: &Path,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<u64>;
}

/// Receives low-level callbacks from a [`BackgroundTransferSession`].
///
/// Callbacks are synchronous because the platform may reclaim the payload
/// at `temp_location` as soon as `on_success` returns. Implementations must
/// finish any relocation before returning and defer the rest of the work.
pub trait TransferEventSink: Send + Sync {
    /// `bytes_expected` is non-positive when the total is unknown.
    fn on_progress(&self, task_id: &str, bytes_written: i64, bytes_expected: i64);

    fn on_success(&self, task_id: &str, temp_location: &Path);

    fn on_failure(&self, task_id: &str, error: &str);

    /// The session has delivered every queued event for `session_id`.
    fn on_session_events_finished(&self, session_id: &str);
}

/// Background-capable transfer facility.
///
/// Transfers keep running when the process exits. On the next launch the
/// host lists outstanding ids with [`list_outstanding`] and the engine
/// re-adopts them.
///
/// [`list_outstanding`]: BackgroundTransferSession::list_outstanding
#[async_trait]
pub trait BackgroundTransferSession: Send + Sync {
    /// Stable identifier of this session.
    fn session_id(&self) -> String;

    /// Register the sink that receives callbacks for every transfer.
    async fn attach(&self, sink: Arc<dyn TransferEventSink>) -> Result<()>;

    /// Start a transfer and return its platform task id.
    async fn submit_transfer(&self, locator: &str) -> Result<String>;

    /// Best-effort cancellation; a success callback may still arrive.
    async fn cancel_transfer(&self, task_id: &str) -> Result<()>;

    /// Task ids of transfers that have not reported a terminal callback.
    async fn list_outstanding(&self) -> Result<Vec<String>>;
}
