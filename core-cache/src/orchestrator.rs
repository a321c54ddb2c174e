//! # Cache Orchestrator
//!
//! Decides when an item is fetched and reconciles transfer outcomes into
//! durable state and the cache directory.
//!
//! ## Lifecycle
//!
//! ```text
//! not cached --request_cache--> downloading --success + valid--> cached
//!      ^                             |                             |
//!      +------ failure / cancel -----+                             |
//!      +------------------- cancel_or_evict / purge ---------------+
//! ```
//!
//! ## Consistency
//!
//! Every transition of one item runs under that item's lock (shared with the
//! purger). Completion clears the task id before touching the disk, persists
//! the filename only after the payload is in place, and deletes a file before
//! clearing its filename. A completion whose task id no longer matches the
//! durable record belongs to a superseded transfer and is ignored.
//!
//! ## Transports
//!
//! Foreground transfers go through the [`DownloadScheduler`]; each one is
//! awaited by a small waiter task. Background transfers go through the
//! platform session and report back via the delegate bridge.
//!
//! [`DownloadScheduler`]: crate::scheduler::DownloadScheduler

use crate::config::CacheLayout;
use crate::error::{CacheError, Result};
use crate::filename::cache_filename;
use crate::locks::ItemLocks;
use crate::models::{CacheStatus, CacheableItem, ItemId, TaskIdMapping};
use crate::progress::ProgressTracker;
use crate::queue::{diff_membership, PlaybackQueue, QueueDelta};
use crate::release::{release_cached_file, Release};
use crate::repository::{CacheItemRepository, TaskMappingRepository};
use crate::scheduler::{DownloadScheduler, TransferEvent};
use crate::transfer::{TransferOutcome, TransferTask};
use crate::validator::{LoftyPayloadValidator, PayloadValidator};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::{Clock, SystemClock};
use bridge_traits::transfer::BackgroundTransferSession;
use bridge_traits::{NothingPlaying, PlaybackMonitor};
use core_async::sync::{broadcast, watch, CancellationToken};
use core_async::task::JoinHandle;
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_runtime::logging::strip_path;
use futures::future::{select, Either};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What `cancel_or_evict` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrEvict {
    CancelledTransfer,
    Evicted,
    /// Cached, but pinned or open for playback
    Retained(RetainReason),
    NotCached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainReason {
    Pinned,
    Playing,
}

/// Summary of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptionReport {
    /// Outstanding platform transfers re-attached to their items
    pub adopted: usize,
    /// Outstanding transfers with no usable mapping
    pub unmapped: usize,
    /// Outstanding transfers whose adoption failed
    pub failed: usize,
    /// Mappings and task ids left behind by transfers that no longer exist
    pub stale_cleared: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InFlight {
    Foreground { locator: String, task_id: String },
    Background { task_id: String },
}

impl InFlight {
    fn task_id(&self) -> &str {
        match self {
            InFlight::Foreground { task_id, .. } | InFlight::Background { task_id } => task_id,
        }
    }
}

enum Abandon {
    Failed(String),
    Cancelled,
}

/// Coordinates transfers, durable item state and the cache directory.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    items: Arc<dyn CacheItemRepository>,
    mappings: Arc<dyn TaskMappingRepository>,
    file_system: Arc<dyn FileSystemAccess>,
    layout: CacheLayout,
    default_extension: String,
    scheduler: Option<DownloadScheduler>,
    background: Option<Arc<dyn BackgroundTransferSession>>,
    prefer_background: bool,
    validator: Arc<dyn PayloadValidator>,
    playback: Arc<dyn PlaybackMonitor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    progress: ProgressTracker,
    locks: Arc<ItemLocks>,
    in_flight: Mutex<HashMap<ItemId, InFlight>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Builder for [`CacheOrchestrator`].
pub struct CacheOrchestratorBuilder {
    items: Arc<dyn CacheItemRepository>,
    mappings: Arc<dyn TaskMappingRepository>,
    file_system: Arc<dyn FileSystemAccess>,
    layout: CacheLayout,
    default_extension: String,
    scheduler: Option<DownloadScheduler>,
    background: Option<Arc<dyn BackgroundTransferSession>>,
    prefer_background: bool,
    validator: Option<Arc<dyn PayloadValidator>>,
    playback: Option<Arc<dyn PlaybackMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventBus>,
    locks: Option<Arc<ItemLocks>>,
}

impl CacheOrchestratorBuilder {
    pub fn default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    pub fn scheduler(mut self, scheduler: DownloadScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Attach the platform background session.
    ///
    /// With `prefer` set, new transfers use it even when a scheduler exists.
    pub fn background_session(
        mut self,
        session: Arc<dyn BackgroundTransferSession>,
        prefer: bool,
    ) -> Self {
        self.background = Some(session);
        self.prefer_background = prefer;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn playback_monitor(mut self, monitor: Arc<dyn PlaybackMonitor>) -> Self {
        self.playback = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Share item locks with another component, typically the purger.
    pub fn item_locks(mut self, locks: Arc<ItemLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<CacheOrchestrator> {
        if self.scheduler.is_none() && self.background.is_none() {
            return Err(CacheError::InvalidConfig(
                "a download scheduler or a background transfer session is required".to_string(),
            ));
        }

        Ok(CacheOrchestrator {
            inner: Arc::new(OrchestratorInner {
                items: self.items,
                mappings: self.mappings,
                file_system: self.file_system,
                layout: self.layout,
                default_extension: self.default_extension,
                scheduler: self.scheduler,
                background: self.background,
                prefer_background: self.prefer_background,
                validator: self
                    .validator
                    .unwrap_or_else(|| Arc::new(LoftyPayloadValidator::new())),
                playback: self.playback.unwrap_or_else(|| Arc::new(NothingPlaying)),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                events: self.events.unwrap_or_default(),
                progress: ProgressTracker::new(),
                locks: self.locks.unwrap_or_default(),
                in_flight: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl CacheOrchestrator {
    pub fn builder(
        items: Arc<dyn CacheItemRepository>,
        mappings: Arc<dyn TaskMappingRepository>,
        file_system: Arc<dyn FileSystemAccess>,
        layout: CacheLayout,
    ) -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder {
            items,
            mappings,
            file_system,
            layout,
            default_extension: "mp3".to_string(),
            scheduler: None,
            background: None,
            prefer_background: false,
            validator: None,
            playback: None,
            clock: None,
            events: None,
            locks: None,
        }
    }

    /// Start forwarding scheduler progress. Call once after construction.
    pub fn start(&self) {
        self.inner.spawn_progress_listener();
    }

    /// Clear the durable `queued` flag of every item missing from `queue`.
    ///
    /// Membership changes made while no watcher ran are otherwise never
    /// seen, and an item left flagged could never be purged. Returns the
    /// number of flags cleared.
    pub async fn reconcile_queue(&self, queue: &PlaybackQueue) -> Result<usize> {
        let present: HashSet<ItemId> = queue.snapshot().into_iter().collect();
        let mut cleared = 0;
        for item in self.inner.items.find_queued().await? {
            if present.contains(&item.id) {
                continue;
            }
            self.inner.items.set_queued(&item.id, false).await?;
            cleared += 1;
        }
        if cleared > 0 {
            info!(cleared, "Cleared queued flags of items no longer queued");
        }
        Ok(cleared)
    }

    /// Mirror `queue` membership into cache requests and cancellations.
    ///
    /// The current contents count as newly added.
    pub fn watch_queue(&self, queue: &PlaybackQueue) {
        self.inner.spawn_queue_watcher(queue.subscribe());
    }

    /// Start caching `item` unless it is cached or already downloading.
    ///
    /// Unknown items are registered first. Returns true iff a new transfer
    /// was started.
    pub async fn request_cache(&self, item: &CacheableItem) -> Result<bool> {
        self.inner.request_cache(item).await
    }

    /// [`request_cache`](Self::request_cache) for an item already in the store.
    pub async fn request_cache_by_id(&self, id: &ItemId) -> Result<bool> {
        let item = self
            .inner
            .items
            .find_by_id(id)
            .await?
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        self.inner.request_cache(&item).await
    }

    /// Cancel the item's transfer if one is outstanding, otherwise evict its
    /// cached file unless it is pinned or open for playback.
    pub async fn cancel_or_evict(&self, id: &ItemId) -> Result<CancelOrEvict> {
        self.inner.cancel_or_evict(id).await
    }

    /// Record transfer progress. Unknown totals (`bytes_expected == 0`) are ignored.
    pub fn report_progress(&self, id: &ItemId, bytes_written: u64, bytes_expected: u64) {
        self.inner.report_progress(id, bytes_written, bytes_expected);
    }

    /// Commit a successful transfer of `task_id` whose payload sits at `payload`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the item vanished, a file system error if the payload
    /// could not be placed, or `NotPlayable` if validation failed. In every
    /// error case the item is left not cached; the payload may remain at
    /// `payload` and belongs to the caller.
    pub async fn complete_download(
        &self,
        id: &ItemId,
        task_id: &str,
        payload: &Path,
    ) -> Result<()> {
        self.inner.complete_download(id, task_id, payload).await
    }

    /// Record a failed transfer. Failures are logged, not retried.
    pub async fn fail_download(&self, id: &ItemId, task_id: &str, reason: &str) -> Result<()> {
        self.inner
            .abandon(id, task_id, Abandon::Failed(reason.to_string()))
            .await
    }

    /// Item fed by the transfer `task_id`, if known.
    pub async fn resolve_item_by_task_id(&self, task_id: &str) -> Result<Option<ItemId>> {
        self.inner.resolve_item_by_task_id(task_id).await
    }

    /// Re-attach platform transfers that survived a restart and clear
    /// bookkeeping left by transfers that no longer exist.
    pub async fn adopt_outstanding_transfers(&self) -> Result<AdoptionReport> {
        self.inner.adopt_outstanding_transfers().await
    }

    pub async fn cache_status(&self, id: &ItemId) -> Result<CacheStatus> {
        if let Some(fraction) = self.inner.progress.fraction(id) {
            return Ok(CacheStatus::Downloading(Some(fraction).filter(|f| *f > 0.0)));
        }

        Ok(match self.inner.items.find_by_id(id).await? {
            Some(CacheableItem {
                cached_filename: Some(filename),
                ..
            }) => CacheStatus::Cached(filename),
            _ => CacheStatus::NotCached,
        })
    }

    /// Absolute path of the cached file, if the item is cached.
    pub async fn cached_path(&self, id: &ItemId) -> Result<Option<PathBuf>> {
        Ok(self
            .inner
            .items
            .find_by_id(id)
            .await?
            .and_then(|item| item.cached_filename)
            .map(|filename| self.inner.layout.cached_path(&filename)))
    }

    /// Observe an item's download fraction; `None` when not downloading.
    pub fn progress(&self, id: &ItemId) -> watch::Receiver<Option<f64>> {
        self.inner.progress.watch(id)
    }

    pub fn is_downloading(&self, id: &ItemId) -> bool {
        self.inner.progress.is_downloading(id)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    pub fn item_locks(&self) -> Arc<ItemLocks> {
        Arc::clone(&self.inner.locks)
    }

    /// Stop every owned worker and wait for in-progress commits to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!("Cache orchestrator shut down");
    }
}

impl OrchestratorInner {
    fn uses_background(&self) -> bool {
        self.background.is_some() && (self.prefer_background || self.scheduler.is_none())
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.emit(CoreEvent::Download(event));
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
    }

    fn end_tracking(&self, id: &ItemId) {
        self.progress.finish(id);
        self.in_flight.lock().remove(id);
    }

    fn foreground_in_flight(&self, locator: &str) -> bool {
        self.in_flight.lock().values().any(|flight| {
            matches!(flight, InFlight::Foreground { locator: current, .. } if current == locator)
        })
    }

    fn items_for_task(&self, task_id: &str) -> Vec<ItemId> {
        self.in_flight
            .lock()
            .iter()
            .filter(|(_, flight)| flight.task_id() == task_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[instrument(skip(self, item), fields(item_id = %item.id))]
    async fn request_cache(self: &Arc<Self>, item: &CacheableItem) -> Result<bool> {
        let _guard = self.locks.acquire(&item.id).await;

        let current = match self.items.find_by_id(&item.id).await? {
            Some(current) => current,
            None => {
                debug!("Registering unknown item");
                self.items.upsert(item).await?;
                item.clone()
            }
        };

        if let Some(filename) = &current.cached_filename {
            let path = self.layout.cached_path(filename);
            if self.file_system.exists(&path).await? {
                debug!("Item already cached");
                return Ok(false);
            }
            warn!(filename = %filename, "Cached file is missing; clearing stale record");
            self.items.set_cached_filename(&current.id, None).await?;
        }

        if !self.progress.try_begin(&current.id) {
            debug!("Item already downloading");
            return Ok(false);
        }

        match self.start_transfer(&current).await {
            Ok(()) => Ok(true),
            Err(err) => {
                self.end_tracking(&current.id);
                warn!(error = %err, "Failed to start transfer");
                Err(err)
            }
        }
    }

    async fn start_transfer(self: &Arc<Self>, item: &CacheableItem) -> Result<()> {
        if self.uses_background() {
            return self.start_background_transfer(item).await;
        }

        let scheduler = self.scheduler.as_ref().ok_or_else(|| {
            CacheError::NotInitialized("no foreground transfer client".to_string())
        })?;

        let task = scheduler.submit(&item.locator);
        self.in_flight.lock().insert(
            item.id.clone(),
            InFlight::Foreground {
                locator: item.locator.clone(),
                task_id: task.id().to_string(),
            },
        );

        if let Err(err) = self.items.set_transfer_task_id(&item.id, Some(task.id())).await {
            self.in_flight.lock().remove(&item.id);
            if !self.foreground_in_flight(&item.locator) {
                scheduler.cancel(&item.locator);
            }
            return Err(err);
        }

        info!(task_id = task.id(), "Foreground transfer started");
        self.emit(DownloadEvent::Started {
            item_id: item.id.to_string(),
            task_id: task.id().to_string(),
            background: false,
        });

        self.spawn_waiter(item.id.clone(), task);
        Ok(())
    }

    async fn start_background_transfer(&self, item: &CacheableItem) -> Result<()> {
        let session = self.background.as_ref().ok_or_else(|| {
            CacheError::NotInitialized("no background transfer session".to_string())
        })?;

        let task_id = session.submit_transfer(&item.locator).await?;
        self.in_flight.lock().insert(
            item.id.clone(),
            InFlight::Background {
                task_id: task_id.clone(),
            },
        );

        let mapping = TaskIdMapping::new(
            task_id.clone(),
            item.id.clone(),
            item.locator.clone(),
            self.clock.unix_timestamp(),
        );
        let persisted = match self.mappings.upsert_mapping(&mapping).await {
            Ok(()) => self.items.set_transfer_task_id(&item.id, Some(&task_id)).await,
            Err(err) => Err(err),
        };

        if let Err(err) = persisted {
            self.in_flight.lock().remove(&item.id);
            if let Err(cancel_err) = session.cancel_transfer(&task_id).await {
                debug!(task_id = %task_id, error = %cancel_err, "Cancel after failed start");
            }
            self.forget_mapping(&task_id).await;
            return Err(err);
        }

        info!(task_id = %task_id, "Background transfer started");
        self.emit(DownloadEvent::Started {
            item_id: item.id.to_string(),
            task_id,
            background: true,
        });
        Ok(())
    }

    /// Await one foreground transfer and settle its item.
    fn spawn_waiter(self: &Arc<Self>, id: ItemId, task: TransferTask) {
        let inner = Arc::clone(self);
        let handle = core_async::spawn(async move {
            let outcome = {
                let wait = Box::pin(task.wait());
                let stopped = Box::pin(inner.shutdown.cancelled());
                match select(wait, stopped).await {
                    Either::Left((outcome, _)) => outcome,
                    Either::Right(_) => return,
                }
            };
            inner.settle_foreground(&id, &task, outcome).await;
        });
        self.track_worker(handle);
    }

    async fn settle_foreground(&self, id: &ItemId, task: &TransferTask, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Success { payload, .. } => {
                if let Err(err) = self.complete_download(id, task.id(), &payload).await {
                    warn!(item_id = %id, error = %err, "Download could not be committed");
                }
                // Another item sharing the locator may still need the payload.
                if !self.foreground_in_flight(task.locator()) {
                    self.discard_file(&payload).await;
                }
            }
            TransferOutcome::Failure(reason) => {
                if let Err(err) = self.abandon(id, task.id(), Abandon::Failed(reason)).await {
                    warn!(item_id = %id, error = %err, "Failed to record transfer failure");
                }
            }
            TransferOutcome::Cancelled => {
                if let Err(err) = self.abandon(id, task.id(), Abandon::Cancelled).await {
                    warn!(item_id = %id, error = %err, "Failed to record cancellation");
                }
            }
        }
    }

    #[instrument(skip(self, payload), fields(item_id = %id))]
    async fn complete_download(&self, id: &ItemId, task_id: &str, payload: &Path) -> Result<()> {
        let _guard = self.locks.acquire(id).await;

        let Some(item) = self.items.find_by_id(id).await? else {
            self.end_tracking(id);
            return Err(CacheError::NotFound(id.to_string()));
        };

        if item.transfer_task_id.as_deref() != Some(task_id) {
            debug!(task_id, "Ignoring completion of superseded transfer");
            return Ok(());
        }

        // Nobody may observe "downloading" once the transfer is over.
        self.end_tracking(id);
        self.items.set_transfer_task_id(id, None).await?;
        self.forget_mapping(task_id).await;

        let filename = cache_filename(&item.locator, &self.default_extension);
        let destination = self.layout.cached_path(&filename);

        if let Err(err) = self.place_payload(payload, &destination).await {
            warn!(error = %err, "Failed to move payload into the cache");
            self.emit(DownloadEvent::Failed {
                item_id: id.to_string(),
                message: err.to_string(),
            });
            return Err(err);
        }

        if let Err(err) = self.items.set_cached_filename(id, Some(&filename)).await {
            // Another item may already point at the same file.
            if matches!(self.items.count_by_cached_filename(&filename).await, Ok(0)) {
                self.discard_file(&destination).await;
            }
            return Err(err);
        }

        match self.validator.validate(id.as_str(), &destination).await {
            Ok(validated) => {
                self.items.set_duration(id, validated.duration_ms).await?;
                info!(filename = %filename, duration_ms = ?validated.duration_ms, "Episode cached");
                self.emit(DownloadEvent::Completed {
                    item_id: id.to_string(),
                    cached_filename: filename,
                    duration_ms: validated.duration_ms,
                });
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Downloaded payload failed validation");
                if let Err(release_err) = self.release_file(id, &filename).await {
                    warn!(error = %release_err, "Failed to discard invalid payload");
                }
                self.emit(DownloadEvent::Failed {
                    item_id: id.to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Move the payload to `destination`, replacing an existing file.
    async fn place_payload(&self, payload: &Path, destination: &Path) -> Result<()> {
        if self.file_system.exists(destination).await? {
            let file = destination.to_string_lossy();
            if !self.file_system.exists(payload).await? {
                debug!(file = %strip_path(&file), "Payload already in place");
                return Ok(());
            }
            warn!(file = %strip_path(&file), "Replacing existing cached file");
            self.file_system
                .delete_file(destination)
                .await
                .map_err(|e| CacheError::file_system("Failed to remove existing file", e))?;
        }

        self.file_system
            .move_file(payload, destination)
            .await
            .map_err(|e| CacheError::file_system("Failed to move payload", e))
    }

    async fn abandon(&self, id: &ItemId, task_id: &str, reason: Abandon) -> Result<()> {
        let _guard = self.locks.acquire(id).await;

        let Some(item) = self.items.find_by_id(id).await? else {
            self.end_tracking(id);
            return Ok(());
        };

        if item.transfer_task_id.as_deref() != Some(task_id) {
            debug!(item_id = %id, task_id, "Ignoring outcome of superseded transfer");
            return Ok(());
        }

        self.end_tracking(id);
        self.items.set_transfer_task_id(id, None).await?;
        self.forget_mapping(task_id).await;

        match reason {
            Abandon::Failed(message) => {
                warn!(item_id = %id, task_id, reason = %message, "Transfer failed");
                self.emit(DownloadEvent::Failed {
                    item_id: id.to_string(),
                    message,
                });
            }
            Abandon::Cancelled => {
                debug!(item_id = %id, task_id, "Transfer cancelled");
                self.emit(DownloadEvent::Cancelled {
                    item_id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %id))]
    async fn cancel_or_evict(&self, id: &ItemId) -> Result<CancelOrEvict> {
        let _guard = self.locks.acquire(id).await;

        let item = self
            .items
            .find_by_id(id)
            .await?
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;

        let flight = self.in_flight.lock().remove(id);
        if flight.is_some() || item.transfer_task_id.is_some() {
            self.cancel_transfer(&item, flight).await;
            self.progress.finish(id);
            if let Some(task_id) = &item.transfer_task_id {
                self.items.set_transfer_task_id(id, None).await?;
                self.forget_mapping(task_id).await;
            }
            info!("In-flight transfer cancelled");
            self.emit(DownloadEvent::Cancelled {
                item_id: id.to_string(),
            });
            return Ok(CancelOrEvict::CancelledTransfer);
        }

        let Some(filename) = item.cached_filename else {
            return Ok(CancelOrEvict::NotCached);
        };

        if item.pinned {
            debug!("Pinned item retained");
            return Ok(CancelOrEvict::Retained(RetainReason::Pinned));
        }

        if self.playback.is_open_for_playback(id.as_str()) {
            debug!("Item open for playback retained");
            return Ok(CancelOrEvict::Retained(RetainReason::Playing));
        }

        let release = self.release_file(id, &filename).await?;

        info!(filename = %filename, ?release, "Cached item evicted");
        self.emit(DownloadEvent::Evicted {
            item_id: id.to_string(),
        });
        Ok(CancelOrEvict::Evicted)
    }

    async fn cancel_transfer(&self, item: &CacheableItem, flight: Option<InFlight>) {
        match flight {
            Some(InFlight::Foreground { locator, .. }) => {
                if self.foreground_in_flight(&locator) {
                    debug!("Transfer shared with another item; leaving it running");
                } else if let Some(scheduler) = &self.scheduler {
                    scheduler.cancel(&locator);
                }
            }
            Some(InFlight::Background { task_id }) => self.cancel_background(&task_id).await,
            None => {
                if let Some(task_id) = &item.transfer_task_id {
                    self.cancel_background(task_id).await;
                }
            }
        }
    }

    async fn cancel_background(&self, task_id: &str) {
        let Some(session) = &self.background else {
            return;
        };
        if let Err(err) = session.cancel_transfer(task_id).await {
            debug!(task_id, error = %err, "Background cancel failed");
        }
    }

    fn report_progress(&self, id: &ItemId, bytes_written: u64, bytes_expected: u64) {
        if bytes_expected == 0 {
            return;
        }

        let fraction = bytes_written as f64 / bytes_expected as f64;
        if self.progress.update(id, fraction).is_some() {
            self.emit(DownloadEvent::Progress {
                item_id: id.to_string(),
                bytes_written,
                bytes_expected,
            });
        }
    }

    async fn resolve_item_by_task_id(&self, task_id: &str) -> Result<Option<ItemId>> {
        if let Some(id) = self.items_for_task(task_id).into_iter().next() {
            return Ok(Some(id));
        }

        if let Some(item) = self.items.find_by_transfer_task_id(task_id).await? {
            return Ok(Some(item.id));
        }

        Ok(self
            .mappings
            .find_mapping(task_id)
            .await?
            .map(|mapping| mapping.item_id))
    }

    #[instrument(skip(self))]
    async fn adopt_outstanding_transfers(&self) -> Result<AdoptionReport> {
        let outstanding = match &self.background {
            Some(session) => session.list_outstanding().await?,
            None => Vec::new(),
        };

        let mut report = AdoptionReport::default();
        for task_id in &outstanding {
            match self.adopt(task_id).await {
                Ok(true) => report.adopted += 1,
                Ok(false) => report.unmapped += 1,
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "Failed to adopt background transfer");
                    report.failed += 1;
                }
            }
        }

        let outstanding: HashSet<&str> = outstanding.iter().map(String::as_str).collect();

        for mapping in self.mappings.list_mappings().await? {
            if !outstanding.contains(mapping.platform_task_id.as_str()) {
                debug!(task_id = %mapping.platform_task_id, "Dropping mapping of finished transfer");
                self.forget_mapping(&mapping.platform_task_id).await;
                report.stale_cleared += 1;
            }
        }

        for item in self.items.find_downloading().await? {
            if self.progress.is_downloading(&item.id) {
                continue;
            }
            let _guard = self.locks.acquire(&item.id).await;
            if self.progress.is_downloading(&item.id) {
                continue;
            }
            debug!(item_id = %item.id, "Clearing task id of a transfer that no longer exists");
            self.items.set_transfer_task_id(&item.id, None).await?;
            report.stale_cleared += 1;
        }

        info!(
            adopted = report.adopted,
            unmapped = report.unmapped,
            failed = report.failed,
            stale_cleared = report.stale_cleared,
            "Startup transfer reconciliation complete"
        );
        Ok(report)
    }

    async fn adopt(&self, task_id: &str) -> Result<bool> {
        let Some(mapping) = self.mappings.find_mapping(task_id).await? else {
            debug!(task_id, "Outstanding transfer has no mapping");
            return Ok(false);
        };

        let _guard = self.locks.acquire(&mapping.item_id).await;

        let Some(item) = self.items.find_by_id(&mapping.item_id).await? else {
            warn!(task_id, item_id = %mapping.item_id, "Mapped item no longer exists");
            return Ok(false);
        };

        if item.is_cached() {
            debug!(task_id, item_id = %item.id, "Item already cached; dropping duplicate transfer");
            self.cancel_background(task_id).await;
            self.forget_mapping(task_id).await;
            return Ok(false);
        }

        if item.transfer_task_id.as_deref() != Some(task_id) {
            self.items.set_transfer_task_id(&item.id, Some(task_id)).await?;
        }

        self.progress.try_begin(&item.id);
        self.in_flight.lock().insert(
            item.id.clone(),
            InFlight::Background {
                task_id: task_id.to_string(),
            },
        );

        info!(task_id, item_id = %item.id, "Background transfer adopted");
        self.emit(DownloadEvent::Adopted {
            item_id: item.id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(true)
    }

    async fn forget_mapping(&self, task_id: &str) {
        if let Err(err) = self.mappings.delete_mapping(task_id).await {
            warn!(task_id, error = %err, "Failed to delete task mapping");
        }
    }

    async fn release_file(&self, id: &ItemId, filename: &str) -> Result<Release> {
        release_cached_file(
            self.items.as_ref(),
            self.file_system.as_ref(),
            &self.layout,
            id,
            filename,
        )
        .await
    }

    async fn discard_file(&self, path: &Path) {
        if let Err(err) = self.file_system.delete_file(path).await {
            if !err.is_not_found() {
                let file = path.to_string_lossy();
                warn!(file = %strip_path(&file), error = %err, "Failed to delete file");
            }
        }
    }

    fn spawn_progress_listener(self: &Arc<Self>) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };

        let mut events = scheduler.subscribe();
        let inner = Arc::clone(self);
        let handle = core_async::spawn(async move {
            loop {
                let next = {
                    let stopped = Box::pin(inner.shutdown.cancelled());
                    let received = Box::pin(events.recv());
                    match select(stopped, received).await {
                        Either::Left(_) => break,
                        Either::Right((event, _)) => event,
                    }
                };

                match next {
                    Ok(TransferEvent::Progress {
                        task_id, progress, ..
                    }) => {
                        let Some(expected) = progress.bytes_expected else {
                            continue;
                        };
                        for id in inner.items_for_task(&task_id) {
                            inner.report_progress(&id, progress.bytes_written, expected);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Progress listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.track_worker(handle);
    }

    fn spawn_queue_watcher(self: &Arc<Self>, mut queue: watch::Receiver<Vec<ItemId>>) {
        let inner = Arc::clone(self);
        let handle = core_async::spawn(async move {
            let mut previous: Vec<ItemId> = Vec::new();
            loop {
                let snapshot = queue.borrow_and_update().clone();
                let delta = diff_membership(&previous, &snapshot);
                previous = snapshot;

                if !delta.is_empty() {
                    inner.apply_queue_delta(delta).await;
                }

                let changed = {
                    let stopped = Box::pin(inner.shutdown.cancelled());
                    let changed = Box::pin(queue.changed());
                    match select(stopped, changed).await {
                        Either::Left(_) => false,
                        Either::Right((result, _)) => result.is_ok(),
                    }
                };
                if !changed {
                    break;
                }
            }
            debug!("Queue watcher stopped");
        });
        self.track_worker(handle);
    }

    async fn apply_queue_delta(self: &Arc<Self>, delta: QueueDelta) {
        debug!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            "Queue membership changed"
        );

        for id in delta.removed {
            if let Err(err) = self.items.set_queued(&id, false).await {
                warn!(item_id = %id, error = %err, "Failed to clear queued flag");
            }
            match self.cancel_or_evict(&id).await {
                Ok(action) => debug!(item_id = %id, ?action, "Dequeued item handled"),
                Err(err) => warn!(item_id = %id, error = %err, "Failed to handle dequeued item"),
            }
        }

        for id in delta.added {
            if let Err(err) = self.items.set_queued(&id, true).await {
                warn!(item_id = %id, error = %err, "Queued item is not known to the cache");
                continue;
            }

            let item = match self.items.find_by_id(&id).await {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(err) => {
                    warn!(item_id = %id, error = %err, "Failed to load queued item");
                    continue;
                }
            };

            if let Err(err) = self.request_cache(&item).await {
                warn!(item_id = %id, error = %err, "Failed to start caching queued item");
            }
        }
    }
}
