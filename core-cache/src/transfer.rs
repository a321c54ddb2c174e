//! Transfer tasks tracked by the download scheduler.
//!
//! A [`TransferTask`] is a cheap, cloneable handle. Every caller that submits
//! the same locator while a transfer is outstanding receives a clone of the
//! same handle and therefore observes the same single terminal outcome.

use core_async::sync::{watch, CancellationToken};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle of a transfer inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Active,
    Finished,
}

/// Terminal result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The payload sits at `payload` and now belongs to the consumer.
    Success { payload: PathBuf, bytes: u64 },
    Failure(String),
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success { .. })
    }
}

#[derive(Clone)]
pub struct TransferTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: String,
    locator: String,
    state: Mutex<TransferState>,
    outcome: watch::Sender<Option<TransferOutcome>>,
    cancel: CancellationToken,
}

impl TransferTask {
    pub(crate) fn new(locator: impl Into<String>, cancel: CancellationToken) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4().to_string(),
                locator: locator.into(),
                state: Mutex::new(TransferState::Pending),
                outcome,
                cancel,
            }),
        }
    }

    /// Scheduler-assigned identifier, unique per transfer attempt.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn locator(&self) -> &str {
        &self.inner.locator
    }

    pub fn state(&self) -> TransferState {
        *self.inner.state.lock()
    }

    /// The terminal outcome, once finished.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> TransferOutcome {
        let mut receiver = self.inner.outcome.subscribe();
        loop {
            if let Some(outcome) = receiver.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives in `self`, so this only fails if the task is torn down.
            if receiver.changed().await.is_err() {
                return TransferOutcome::Cancelled;
            }
        }
    }

    pub fn same_task(&self, other: &TransferTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Move `Pending` to `Active`. Returns false if the task already left `Pending`.
    pub(crate) fn activate(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state != TransferState::Pending {
            return false;
        }
        *state = TransferState::Active;
        true
    }

    /// Record the terminal outcome. The first call wins; later calls return false.
    pub(crate) fn finish(&self, outcome: TransferOutcome) -> bool {
        let mut state = self.inner.state.lock();
        if *state == TransferState::Finished {
            return false;
        }
        *state = TransferState::Finished;
        self.inner.outcome.send_replace(Some(outcome));
        true
    }
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
