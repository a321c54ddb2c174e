//! # Bounded Download Scheduler
//!
//! Runs foreground transfers with at most `limit` active at once.
//!
//! ## Guarantees
//!
//! - `submit` is idempotent per locator while a transfer is pending or active
//! - Pending transfers are promoted strictly in submission order
//! - Cancelling a pending transfer never touches the network
//! - Cancelling an active transfer is best effort; a success that lands
//!   first wins and the cancellation becomes a no-op
//! - The scheduler never retries
//!
//! Results are broadcast as [`TransferEvent`]s. Every subscriber gets its own
//! lazy sequence through [`DownloadScheduler::results`]. Within one transfer,
//! progress events always precede the terminal event.

use crate::transfer::{TransferOutcome, TransferTask};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transfer::{TransferClient, TransferProgress};
use core_async::sync::{broadcast, mpsc, CancellationToken};
use core_runtime::logging::{redact_locator, strip_path};
use futures::future::{select, Either};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 512;

/// Lifecycle notifications for scheduled transfers.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Began {
        task_id: String,
        locator: String,
    },
    Progress {
        task_id: String,
        locator: String,
        progress: TransferProgress,
    },
    Finished(TransferResult),
}

/// Terminal outcome of one transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub task_id: String,
    pub locator: String,
    pub outcome: TransferOutcome,
}

/// Per-subscriber sequence of terminal outcomes.
pub struct TransferResults {
    receiver: broadcast::Receiver<TransferEvent>,
}

impl TransferResults {
    /// Next terminal outcome, or `None` once the scheduler is gone.
    pub async fn next(&mut self) -> Option<TransferResult> {
        loop {
            match self.receiver.recv().await {
                Ok(TransferEvent::Finished(result)) => return Some(result),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transfer result subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    /// Unfinished tasks by locator
    tasks: HashMap<String, TransferTask>,
    pending: VecDeque<TransferTask>,
    /// Task ids holding a concurrency slot
    active: HashSet<String>,
    closed: bool,
}

struct SchedulerInner {
    client: Arc<dyn TransferClient>,
    file_system: Arc<dyn FileSystemAccess>,
    staging_dir: PathBuf,
    limit: usize,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<TransferEvent>,
    shutdown: CancellationToken,
}

/// Bounded, deduplicating download scheduler.
#[derive(Clone)]
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
}

impl DownloadScheduler {
    /// Create a scheduler that writes payloads under `staging_dir`.
    ///
    /// `limit` is clamped to at least one.
    pub fn new(
        client: Arc<dyn TransferClient>,
        file_system: Arc<dyn FileSystemAccess>,
        staging_dir: impl Into<PathBuf>,
        limit: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                client,
                file_system,
                staging_dir: staging_dir.into(),
                limit: limit.max(1),
                state: Mutex::new(SchedulerState::default()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Queue a transfer for `locator`, or return the outstanding one.
    ///
    /// Must be called from within the async runtime; promotion spawns the
    /// transfer worker.
    pub fn submit(&self, locator: &str) -> TransferTask {
        let task = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.tasks.get(locator) {
                debug!(task_id = existing.id(), "Joining outstanding transfer");
                return existing.clone();
            }

            let task = TransferTask::new(locator, self.inner.shutdown.child_token());
            if state.closed {
                task.finish(TransferOutcome::Cancelled);
                return task;
            }

            state.tasks.insert(locator.to_string(), task.clone());
            state.pending.push_back(task.clone());
            task
        };

        debug!(
            task_id = task.id(),
            locator = %redact_locator(locator),
            "Transfer queued"
        );
        SchedulerInner::pump(&self.inner);
        task
    }

    /// Cancel the outstanding transfer for `locator`.
    ///
    /// Returns false if nothing was outstanding. A pending transfer finishes
    /// as cancelled immediately; an active one is signalled and keeps its
    /// slot until the worker unwinds.
    pub fn cancel(&self, locator: &str) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            let Some(task) = state.tasks.remove(locator) else {
                return false;
            };
            state.pending.retain(|pending| !pending.same_task(&task));
            task
        };

        task.cancellation().cancel();
        if task.finish(TransferOutcome::Cancelled) {
            info!(task_id = task.id(), "Transfer cancelled");
            self.inner.emit_finished(&task, TransferOutcome::Cancelled);
        }

        SchedulerInner::pump(&self.inner);
        true
    }

    /// Outstanding task for `locator`, if any.
    pub fn task_for(&self, locator: &str) -> Option<TransferTask> {
        self.inner.state.lock().tasks.get(locator).cloned()
    }

    /// Subscribe to every transfer event.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to terminal outcomes only.
    pub fn results(&self) -> TransferResults {
        TransferResults {
            receiver: self.subscribe(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Cancel everything and refuse new work.
    pub fn shutdown(&self) {
        let drained: Vec<TransferTask> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pending.clear();
            state.tasks.drain().map(|(_, task)| task).collect()
        };

        self.inner.shutdown.cancel();
        for task in drained {
            if task.finish(TransferOutcome::Cancelled) {
                self.inner.emit_finished(&task, TransferOutcome::Cancelled);
            }
        }
        info!("Download scheduler shut down");
    }
}

impl SchedulerInner {
    /// Promote pending tasks while slots are free.
    fn pump(inner: &Arc<SchedulerInner>) {
        let promoted: Vec<TransferTask> = {
            let mut state = inner.state.lock();
            let mut promoted = Vec::new();
            while state.active.len() < inner.limit {
                let Some(task) = state.pending.pop_front() else {
                    break;
                };
                if !task.activate() {
                    continue;
                }
                state.active.insert(task.id().to_string());
                promoted.push(task);
            }
            promoted
        };

        for task in promoted {
            let _ = inner.events.send(TransferEvent::Began {
                task_id: task.id().to_string(),
                locator: task.locator().to_string(),
            });
            let inner = Arc::clone(inner);
            core_async::spawn(async move {
                inner.run(task).await;
            });
        }
    }

    async fn run(self: Arc<Self>, task: TransferTask) {
        let staging = self.staging_dir.join(format!("{}.part", task.id()));
        debug!(task_id = task.id(), staging = ?staging, "Transfer started");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();
        let forwarder = {
            let events = self.events.clone();
            let task_id = task.id().to_string();
            let locator = task.locator().to_string();
            core_async::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = events.send(TransferEvent::Progress {
                        task_id: task_id.clone(),
                        locator: locator.clone(),
                        progress,
                    });
                }
            })
        };

        let outcome = {
            let fetch = self.client.fetch(task.locator(), &staging, progress_tx);
            let cancelled = Box::pin(task.cancellation().cancelled());
            match select(fetch, cancelled).await {
                Either::Left((Ok(bytes), _)) => TransferOutcome::Success {
                    payload: staging.clone(),
                    bytes,
                },
                Either::Left((Err(err), _)) => TransferOutcome::Failure(err.to_string()),
                Either::Right(_) => TransferOutcome::Cancelled,
            }
        };

        // All progress senders are gone once the fetch future is dropped.
        let _ = forwarder.await;

        let accepted = task.finish(outcome.clone());
        if !accepted || !outcome.is_success() {
            self.discard_staging(&staging).await;
        }

        {
            let mut state = self.state.lock();
            state.active.remove(task.id());
            let still_current = state
                .tasks
                .get(task.locator())
                .map(|current| current.same_task(&task))
                .unwrap_or(false);
            if still_current {
                state.tasks.remove(task.locator());
            }
        }

        if accepted {
            match &outcome {
                TransferOutcome::Success { bytes, .. } => {
                    info!(task_id = task.id(), bytes, "Transfer finished");
                }
                TransferOutcome::Failure(reason) => {
                    warn!(task_id = task.id(), %reason, "Transfer failed");
                }
                TransferOutcome::Cancelled => debug!(task_id = task.id(), "Transfer cancelled"),
            }
            self.emit_finished(&task, outcome);
        } else {
            debug!(task_id = task.id(), "Ignoring outcome of superseded transfer");
        }

        SchedulerInner::pump(&self);
    }

    async fn discard_staging(&self, staging: &Path) {
        if let Err(err) = self.file_system.delete_file(staging).await {
            if !err.is_not_found() {
                let file = staging.to_string_lossy();
                warn!(file = %strip_path(&file), error = %err, "Failed to delete partial payload");
            }
        }
    }

    fn emit_finished(&self, task: &TransferTask, outcome: TransferOutcome) {
        let _ = self.events.send(TransferEvent::Finished(TransferResult {
            task_id: task.id().to_string(),
            locator: task.locator().to_string(),
            outcome,
        }));
    }
}
