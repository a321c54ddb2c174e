//! # Background Transfer Delegate Bridge
//!
//! Turns the platform's synchronous transfer callbacks into messages handled
//! by a single worker task that drives the orchestrator.
//!
//! The platform may reclaim a finished payload as soon as `on_success`
//! returns, so the payload is moved into the staging directory inside the
//! callback. Everything else happens on the worker.

use crate::models::ItemId;
use crate::orchestrator::CacheOrchestrator;
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transfer::TransferEventSink;
use core_async::sync::{mpsc, CancellationToken};
use core_async::task::JoinHandle;
use core_runtime::logging::strip_path;
use futures::future::{select, Either};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Invoked once the platform has delivered every event of a session.
pub type SessionCompletion = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
enum DelegateMessage {
    Progress {
        task_id: String,
        bytes_written: u64,
        bytes_expected: u64,
    },
    Success {
        task_id: String,
        payload: PathBuf,
    },
    Failure {
        task_id: String,
        reason: String,
    },
    SessionFinished {
        session_id: String,
    },
}

/// [`TransferEventSink`] that feeds a [`CacheOrchestrator`].
#[derive(Clone)]
pub struct TransferDelegateBridge {
    inner: Arc<DelegateInner>,
}

struct DelegateInner {
    staging_dir: PathBuf,
    sender: mpsc::UnboundedSender<DelegateMessage>,
    completions: Mutex<HashMap<String, SessionCompletion>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TransferDelegateBridge {
    /// Create the bridge and start its worker. Must be called inside a runtime.
    pub fn new(
        orchestrator: CacheOrchestrator,
        file_system: Arc<dyn FileSystemAccess>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(DelegateInner {
            staging_dir: staging_dir.into(),
            sender,
            completions: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let worker = DelegateWorker {
            orchestrator,
            file_system,
            inner: Arc::clone(&inner),
        };
        let handle = core_async::spawn(worker.run(receiver));
        *inner.worker.lock() = Some(handle);

        Self { inner }
    }

    /// Store the handle to fire when `session_id` reports that it has no
    /// more events. A second registration replaces the first.
    pub fn register_session_completion(
        &self,
        session_id: impl Into<String>,
        completion: SessionCompletion,
    ) {
        self.inner
            .completions
            .lock()
            .insert(session_id.into(), completion);
    }

    /// Stop the worker after the messages already queued are handled.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        debug!("Transfer delegate stopped");
    }

    fn send(&self, message: DelegateMessage) {
        if self.inner.sender.send(message).is_err() {
            warn!("Transfer delegate is shut down; dropping callback");
        }
    }

    /// Move the platform-owned payload somewhere it is guaranteed to survive.
    fn relocate(&self, temp_location: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.inner.staging_dir)?;
        let destination = self
            .inner
            .staging_dir
            .join(format!("bg-{}.part", Uuid::new_v4()));

        if std::fs::rename(temp_location, &destination).is_err() {
            // Different volume; rename cannot cross it.
            std::fs::copy(temp_location, &destination)?;
            if let Err(err) = std::fs::remove_file(temp_location) {
                debug!(error = %err, "Platform payload left in place after copy");
            }
        }
        Ok(destination)
    }
}

impl TransferEventSink for TransferDelegateBridge {
    fn on_progress(&self, task_id: &str, bytes_written: i64, bytes_expected: i64) {
        if bytes_expected <= 0 {
            return;
        }
        self.send(DelegateMessage::Progress {
            task_id: task_id.to_string(),
            bytes_written: bytes_written.max(0) as u64,
            bytes_expected: bytes_expected as u64,
        });
    }

    fn on_success(&self, task_id: &str, temp_location: &Path) {
        match self.relocate(temp_location) {
            Ok(payload) => {
                let file = payload.to_string_lossy();
                debug!(task_id, payload = %strip_path(&file), "Background payload relocated");
                self.send(DelegateMessage::Success {
                    task_id: task_id.to_string(),
                    payload,
                });
            }
            Err(err) => {
                warn!(task_id, error = %err, "Failed to relocate background payload");
                self.send(DelegateMessage::Failure {
                    task_id: task_id.to_string(),
                    reason: format!("Failed to relocate payload: {}", err),
                });
            }
        }
    }

    fn on_failure(&self, task_id: &str, error: &str) {
        self.send(DelegateMessage::Failure {
            task_id: task_id.to_string(),
            reason: error.to_string(),
        });
    }

    fn on_session_events_finished(&self, session_id: &str) {
        self.send(DelegateMessage::SessionFinished {
            session_id: session_id.to_string(),
        });
    }
}

struct DelegateWorker {
    orchestrator: CacheOrchestrator,
    file_system: Arc<dyn FileSystemAccess>,
    inner: Arc<DelegateInner>,
}

impl DelegateWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<DelegateMessage>) {
        loop {
            let message = {
                let stopped = Box::pin(self.inner.shutdown.cancelled());
                let received = Box::pin(receiver.recv());
                match select(stopped, received).await {
                    Either::Left(_) => None,
                    Either::Right((message, _)) => message,
                }
            };

            match message {
                Some(message) => self.handle(message).await,
                None => break,
            }
        }

        // Drain what was already delivered so no payload is stranded.
        while let Ok(message) = receiver.try_recv() {
            self.handle(message).await;
        }
    }

    async fn handle(&self, message: DelegateMessage) {
        match message {
            DelegateMessage::Progress {
                task_id,
                bytes_written,
                bytes_expected,
            } => {
                if let Some(id) = self.resolve(&task_id).await {
                    self.orchestrator
                        .report_progress(&id, bytes_written, bytes_expected);
                }
            }
            DelegateMessage::Success { task_id, payload } => {
                self.complete(&task_id, &payload).await;
            }
            DelegateMessage::Failure { task_id, reason } => {
                let Some(id) = self.resolve(&task_id).await else {
                    debug!(task_id = %task_id, "Failure for unknown transfer");
                    return;
                };
                if let Err(err) = self.orchestrator.fail_download(&id, &task_id, &reason).await {
                    warn!(task_id = %task_id, error = %err, "Failed to record transfer failure");
                }
            }
            DelegateMessage::SessionFinished { session_id } => {
                let completion = self.inner.completions.lock().remove(&session_id);
                match completion {
                    Some(completion) => {
                        info!(session_id = %session_id, "Background session drained");
                        completion();
                    }
                    None => debug!(session_id = %session_id, "No completion registered"),
                }
            }
        }
    }

    async fn complete(&self, task_id: &str, payload: &Path) {
        let Some(id) = self.resolve(task_id).await else {
            warn!(task_id, "Orphaned background payload; discarding");
            self.discard(payload).await;
            return;
        };

        if let Err(err) = self.orchestrator.complete_download(&id, task_id, payload).await {
            warn!(task_id, item_id = %id, error = %err, "Background download could not be committed");
        }
        self.discard(payload).await;
    }

    async fn resolve(&self, task_id: &str) -> Option<ItemId> {
        match self.orchestrator.resolve_item_by_task_id(task_id).await {
            Ok(id) => id,
            Err(err) => {
                warn!(task_id, error = %err, "Failed to resolve transfer");
                None
            }
        }
    }

    async fn discard(&self, payload: &Path) {
        if let Err(err) = self.file_system.delete_file(payload).await {
            if !err.is_not_found() {
                let file = payload.to_string_lossy();
                warn!(payload = %strip_path(&file), error = %err, "Failed to delete payload");
            }
        }
    }
}
