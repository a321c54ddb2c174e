//! # Cache Purger
//!
//! Keeps the cache directory under its byte budget by evicting cached items
//! nobody is about to listen to.
//!
//! ## Eviction order
//!
//! Candidates are cached, not queued and not pinned. They are evicted tier
//! by tier, oldest first within a tier:
//!
//! 1. Finished items completed before the staleness threshold, by completion date
//! 2. Unfinished items published before the threshold, by publish date
//! 3. Everything else, by publish date
//!
//! Items open for playback are re-checked right before deletion and skipped.
//!
//! Only one purge runs at a time; a second caller gets
//! [`PurgeOutcome::AlreadyRunning`] straight away. Runs can be cancelled
//! between evictions since every single eviction is complete on its own.

use crate::config::CacheLayout;
use crate::error::{CacheError, Result};
use crate::locks::ItemLocks;
use crate::models::CacheableItem;
use crate::release::{release_cached_file, Release};
use crate::repository::CacheItemRepository;
use bridge_traits::background::{BackgroundExecutor, TaskFuture, TaskHandler};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bridge_traits::PlaybackMonitor;
use core_async::sync::CancellationToken;
use core_runtime::events::{CoreEvent, EventBus, PurgeEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Identifier under which the periodic purge is registered.
pub const PURGE_TASK_ID: &str = "episode-cache.purge";

/// Counters for one purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub bytes_used: u64,
    pub bytes_to_free: u64,
    pub bytes_freed: u64,
    pub items_evicted: u64,
    /// Items whose eviction failed and were skipped
    pub items_failed: u64,
    /// Items kept because they were open for playback
    pub items_playing: u64,
}

impl PurgeReport {
    pub fn satisfied(&self) -> bool {
        self.bytes_freed >= self.bytes_to_free
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Another purge held the claim.
    AlreadyRunning,
    UnderBudget { bytes_used: u64 },
    Completed(PurgeReport),
    Cancelled(PurgeReport),
}

/// What happened to one candidate.
enum Eviction {
    /// Bytes actually returned to the disk; zero when the file is shared
    Freed(u64),
    Playing,
    /// Re-read under the lock and found uncached, queued or pinned
    NoLongerCandidate,
}

/// Order eviction candidates by tier. Pinned and queued items are dropped.
pub fn eviction_order(
    candidates: Vec<CacheableItem>,
    now: i64,
    staleness: Duration,
) -> Vec<CacheableItem> {
    let threshold = now.saturating_sub(i64::try_from(staleness.as_secs()).unwrap_or(i64::MAX));

    let mut stale_finished = Vec::new();
    let mut old_unfinished = Vec::new();
    let mut rest = Vec::new();

    for item in candidates {
        if item.pinned || item.queued || !item.is_cached() {
            continue;
        }
        match item.finished_at {
            Some(finished_at) if finished_at < threshold => stale_finished.push(item),
            None if item.published_at < threshold => old_unfinished.push(item),
            _ => rest.push(item),
        }
    }

    stale_finished.sort_by_key(|item| item.finished_at);
    old_unfinished.sort_by_key(|item| item.published_at);
    rest.sort_by_key(|item| item.published_at);

    stale_finished
        .into_iter()
        .chain(old_unfinished)
        .chain(rest)
        .collect()
}

/// Budget-driven evictor.
pub struct CachePurger {
    items: Arc<dyn CacheItemRepository>,
    file_system: Arc<dyn FileSystemAccess>,
    layout: CacheLayout,
    playback: Arc<dyn PlaybackMonitor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    locks: Arc<ItemLocks>,
    max_cache_size: u64,
    staleness: Duration,
    running: AtomicBool,
}

/// Releases the purge claim when dropped.
struct PurgeClaim<'a> {
    running: &'a AtomicBool,
}

impl Drop for PurgeClaim<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl CachePurger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        items: Arc<dyn CacheItemRepository>,
        file_system: Arc<dyn FileSystemAccess>,
        layout: CacheLayout,
        playback: Arc<dyn PlaybackMonitor>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        locks: Arc<ItemLocks>,
        max_cache_size: u64,
        staleness: Duration,
    ) -> Self {
        Self {
            items,
            file_system,
            layout,
            playback,
            clock,
            events,
            locks,
            max_cache_size,
            staleness,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bytes used by the immediate contents of the cache directory.
    pub async fn cache_usage(&self) -> Result<u64> {
        self.file_system
            .directory_size(&self.layout.cache_dir)
            .await
            .map_err(|e| CacheError::file_system("Failed to measure cache directory", e))
    }

    pub async fn purge(&self) -> Result<PurgeOutcome> {
        self.purge_with_cancellation(&CancellationToken::new()).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn purge_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PurgeOutcome> {
        let Some(_claim) = self.try_claim() else {
            debug!("Purge already running");
            self.emit(PurgeEvent::Skipped {
                reason: "already running".to_string(),
            });
            return Ok(PurgeOutcome::AlreadyRunning);
        };

        let bytes_used = self.cache_usage().await?;
        if bytes_used <= self.max_cache_size {
            debug!(bytes_used, budget = self.max_cache_size, "Cache under budget");
            self.emit(PurgeEvent::Skipped {
                reason: "under budget".to_string(),
            });
            return Ok(PurgeOutcome::UnderBudget { bytes_used });
        }

        let mut report = PurgeReport {
            bytes_used,
            bytes_to_free: bytes_used - self.max_cache_size,
            ..Default::default()
        };
        info!(
            bytes_used,
            bytes_to_free = report.bytes_to_free,
            "Cache over budget; purging"
        );
        self.emit(PurgeEvent::Started {
            bytes_used,
            bytes_to_free: report.bytes_to_free,
        });

        let candidates = eviction_order(
            self.items.find_eviction_candidates().await?,
            self.clock.unix_timestamp(),
            self.staleness,
        );

        let mut cancelled = false;
        for item in candidates {
            if report.satisfied() {
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            match self.evict(&item).await {
                Ok(Eviction::Freed(bytes_freed)) => {
                    report.bytes_freed += bytes_freed;
                    report.items_evicted += 1;
                    self.emit(PurgeEvent::ItemEvicted {
                        item_id: item.id.to_string(),
                        bytes_freed,
                    });
                }
                Ok(Eviction::Playing) => report.items_playing += 1,
                Ok(Eviction::NoLongerCandidate) => {
                    debug!(item_id = %item.id, "Item changed since the candidate query");
                }
                Err(err) => {
                    warn!(item_id = %item.id, error = %err, "Eviction failed; skipping");
                    report.items_failed += 1;
                }
            }
        }

        if !report.satisfied() && !cancelled {
            warn!(
                bytes_freed = report.bytes_freed,
                bytes_to_free = report.bytes_to_free,
                "Eviction candidates exhausted before budget was met"
            );
        }

        info!(
            items_evicted = report.items_evicted,
            bytes_freed = report.bytes_freed,
            cancelled,
            "Cache purge finished"
        );
        self.emit(PurgeEvent::Completed {
            items_evicted: report.items_evicted,
            bytes_freed: report.bytes_freed,
            cancelled,
        });

        Ok(if cancelled {
            PurgeOutcome::Cancelled(report)
        } else {
            PurgeOutcome::Completed(report)
        })
    }

    fn try_claim(&self) -> Option<PurgeClaim<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PurgeClaim {
                running: &self.running,
            })
    }

    async fn evict(&self, candidate: &CacheableItem) -> Result<Eviction> {
        let _guard = self.locks.acquire(&candidate.id).await;

        // Re-read under the lock; the orchestrator may have moved on.
        let Some(item) = self.items.find_by_id(&candidate.id).await? else {
            return Ok(Eviction::NoLongerCandidate);
        };
        let Some(filename) = item.cached_filename.as_deref() else {
            return Ok(Eviction::NoLongerCandidate);
        };
        if item.queued || item.pinned {
            return Ok(Eviction::NoLongerCandidate);
        }

        if self.playback.is_open_for_playback(item.id.as_str()) {
            debug!(item_id = %item.id, "Skipping item open for playback");
            return Ok(Eviction::Playing);
        }

        let path = self.layout.cached_path(filename);
        let size = match self.file_system.metadata(&path).await {
            Ok(metadata) => metadata.size,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(CacheError::file_system("Failed to stat cached file", err)),
        };

        let freed = match release_cached_file(
            self.items.as_ref(),
            self.file_system.as_ref(),
            &self.layout,
            &item.id,
            filename,
        )
        .await?
        {
            Release::Deleted => size,
            Release::Shared => 0,
        };

        debug!(item_id = %item.id, freed, "Evicted cached item");
        Ok(Eviction::Freed(freed))
    }

    fn emit(&self, event: PurgeEvent) {
        let _ = self.events.emit(CoreEvent::Purge(event));
    }
}

/// Periodic purge driven by the host's [`BackgroundExecutor`].
#[derive(Clone)]
pub struct PurgeTask {
    inner: Arc<PurgeTaskInner>,
}

struct PurgeTaskInner {
    purger: Arc<CachePurger>,
    executor: Arc<dyn BackgroundExecutor>,
    interval: Duration,
    current: Mutex<Option<CancellationToken>>,
}

impl PurgeTask {
    pub fn new(
        purger: Arc<CachePurger>,
        executor: Arc<dyn BackgroundExecutor>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PurgeTaskInner {
                purger,
                executor,
                interval,
                current: Mutex::new(None),
            }),
        }
    }

    /// Register the handler and schedule the first run.
    pub async fn register(&self) -> Result<()> {
        let task = self.clone();
        let handler: TaskHandler = Arc::new(move || {
            let task = task.clone();
            Box::pin(async move {
                task.run()
                    .await
                    .map(|_| ())
                    .map_err(|e| bridge_traits::BridgeError::OperationFailed(e.to_string()))
            }) as TaskFuture
        });

        self.inner
            .executor
            .register_task_handler(PURGE_TASK_ID, handler)
            .await?;
        self.schedule_next().await?;
        info!(interval = ?self.inner.interval, "Periodic cache purge registered");
        Ok(())
    }

    /// One scheduled run. The next run is registered before any work starts.
    pub async fn run(&self) -> Result<PurgeOutcome> {
        if let Err(err) = self.schedule_next().await {
            warn!(error = %err, "Failed to schedule next purge");
        }

        let token = CancellationToken::new();
        *self.inner.current.lock() = Some(token.clone());
        let outcome = self.inner.purger.purge_with_cancellation(&token).await;
        self.inner.current.lock().take();
        outcome
    }

    /// Ask the run in progress, if any, to stop after its current eviction.
    pub fn cancel_running(&self) {
        if let Some(token) = self.inner.current.lock().as_ref() {
            token.cancel();
        }
    }

    async fn schedule_next(&self) -> Result<()> {
        self.inner
            .executor
            .schedule_once(PURGE_TASK_ID, self.inner.interval)
            .await?;
        Ok(())
    }
}
