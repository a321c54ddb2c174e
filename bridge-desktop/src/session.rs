//! In-process background transfer session.
//!
//! Desktop processes have no OS-managed transfer daemon, so this session runs
//! transfers on the Tokio runtime and reports through the same
//! [`TransferEventSink`] callbacks a mobile platform would. Transfers do not
//! outlive the process; after a restart `list_outstanding` is empty.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transfer::{BackgroundTransferSession, TransferClient, TransferEventSink, TransferProgress},
};
use core_async::sync::{mpsc, Mutex, RwLock};
use core_async::task::JoinHandle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Background session backed by a foreground [`TransferClient`].
#[derive(Clone)]
pub struct DesktopTransferSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    session_id: String,
    client: Arc<dyn TransferClient>,
    download_dir: PathBuf,
    sink: RwLock<Option<Arc<dyn TransferEventSink>>>,
    transfers: Mutex<HashMap<String, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl DesktopTransferSession {
    /// Create a session that downloads into `download_dir`.
    ///
    /// Payloads in `download_dir` belong to the session and are removed once
    /// the success callback returns.
    pub fn new(
        session_id: impl Into<String>,
        client: Arc<dyn TransferClient>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                session_id: session_id.into(),
                client,
                download_dir: download_dir.into(),
                sink: RwLock::new(None),
                transfers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl SessionInner {
    async fn run(self: Arc<Self>, task_id: String, locator: String) {
        let destination = self.download_dir.join(format!("{}.download", task_id));
        let result = match tokio::fs::create_dir_all(&self.download_dir).await {
            Ok(()) => self.fetch(&task_id, &locator, &destination).await,
            Err(err) => Err(BridgeError::Io(err)),
        };

        let sink = self.sink.read().await.clone();
        match (&result, &sink) {
            (Ok(bytes), Some(sink)) => {
                debug!(task_id = %task_id, bytes, "Desktop transfer finished");
                sink.on_success(&task_id, &destination);
            }
            (Err(err), Some(sink)) => {
                warn!(task_id = %task_id, error = %err, "Desktop transfer failed");
                sink.on_failure(&task_id, &err.to_string());
            }
            (_, None) => warn!(task_id = %task_id, "No sink attached; dropping transfer result"),
        }

        // The payload is only valid for the duration of the callback.
        if let Err(err) = tokio::fs::remove_file(&destination).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(task_id = %task_id, error = %err, "Failed to remove download");
            }
        }

        let drained = {
            let mut transfers = self.transfers.lock().await;
            transfers.remove(&task_id);
            transfers.is_empty()
        };
        if let (true, Some(sink)) = (drained, sink) {
            sink.on_session_events_finished(&self.session_id);
        }
    }

    async fn fetch(&self, task_id: &str, locator: &str, destination: &Path) -> Result<u64> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();
        let sink = self.sink.read().await.clone();
        let progress_task_id = task_id.to_string();
        let forwarder = core_async::spawn(async move {
            while let Some(progress) = rx.recv().await {
                if let Some(sink) = &sink {
                    let expected = progress.bytes_expected.map(|b| b as i64).unwrap_or(-1);
                    sink.on_progress(&progress_task_id, progress.bytes_written as i64, expected);
                }
            }
        });

        let result = self.client.fetch(locator, destination, tx).await;
        // All progress reaches the sink before the terminal callback.
        let _ = forwarder.await;
        result
    }
}

#[async_trait]
impl BackgroundTransferSession for DesktopTransferSession {
    fn session_id(&self) -> String {
        self.inner.session_id.clone()
    }

    async fn attach(&self, sink: Arc<dyn TransferEventSink>) -> Result<()> {
        *self.inner.sink.write().await = Some(sink);
        debug!(session_id = %self.inner.session_id, "Transfer sink attached");
        Ok(())
    }

    async fn submit_transfer(&self, locator: &str) -> Result<String> {
        let task_id = format!(
            "{}-{}",
            self.inner.session_id,
            self.inner.next_id.fetch_add(1, Ordering::Relaxed)
        );

        // Hold the table while spawning so the transfer cannot finish and
        // deregister before it is registered.
        let mut transfers = self.inner.transfers.lock().await;
        let handle = core_async::spawn(
            Arc::clone(&self.inner).run(task_id.clone(), locator.to_string()),
        );
        transfers.insert(task_id.clone(), handle);

        info!(task_id = %task_id, "Desktop background transfer submitted");
        Ok(task_id)
    }

    async fn cancel_transfer(&self, task_id: &str) -> Result<()> {
        let handle = self.inner.transfers.lock().await.remove(task_id);
        let Some(handle) = handle else {
            return Err(BridgeError::TransferNotFound(task_id.to_string()));
        };

        handle.abort();
        let partial = self.inner.download_dir.join(format!("{}.download", task_id));
        let _ = tokio::fs::remove_file(&partial).await;

        if let Some(sink) = self.inner.sink.read().await.clone() {
            sink.on_failure(task_id, "cancelled");
        }
        debug!(task_id, "Desktop background transfer cancelled");
        Ok(())
    }

    async fn list_outstanding(&self) -> Result<Vec<String>> {
        let transfers = self.inner.transfers.lock().await;
        Ok(transfers.keys().cloned().collect())
    }
}
