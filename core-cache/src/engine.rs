//! # Cache Engine
//!
//! Composition root. Builds the repository, scheduler, orchestrator,
//! delegate bridge and purger from a [`CoreConfig`] and a [`CacheConfig`],
//! and hands every component its collaborators explicitly.
//!
//! ```rust,ignore
//! let core = CoreConfig::builder()
//!     .database_path(data_dir.join("episodes.db"))
//!     .build()?;
//! let engine = CacheEngine::new(core, CacheConfig::default()).await?;
//! engine.start().await?;
//!
//! engine.queue().push(ItemId::from("ep-42"));
//! ```

use crate::config::{CacheConfig, CacheLayout};
use crate::db::{create_pool, DatabaseConfig};
use crate::delegate::TransferDelegateBridge;
use crate::error::Result;
use crate::locks::ItemLocks;
use crate::models::{CacheStatus, CacheableItem, ItemId};
use crate::orchestrator::{AdoptionReport, CacheOrchestrator, CancelOrEvict};
use crate::purger::{CachePurger, PurgeOutcome, PurgeTask, PURGE_TASK_ID};
use crate::queue::PlaybackQueue;
use crate::repository::{CacheItemRepository, SqliteCacheRepository};
use crate::scheduler::DownloadScheduler;
use bridge_traits::background::TaskId;
use bridge_traits::transfer::{BackgroundTransferSession, TransferEventSink};
use core_async::sync::watch;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, Receiver};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fully wired episode cache.
pub struct CacheEngine {
    core: CoreConfig,
    config: CacheConfig,
    repository: Arc<SqliteCacheRepository>,
    scheduler: Option<DownloadScheduler>,
    orchestrator: CacheOrchestrator,
    delegate: Option<TransferDelegateBridge>,
    purger: Arc<CachePurger>,
    purge_task: Option<PurgeTask>,
    queue: PlaybackQueue,
    events: EventBus,
    started: AtomicBool,
}

impl CacheEngine {
    /// Open the database at `core.database_path` and build every component.
    pub async fn new(core: CoreConfig, config: CacheConfig) -> Result<Self> {
        let pool = create_pool(DatabaseConfig::new(&core.database_path)).await?;
        Self::with_pool(core, config, pool).await
    }

    /// Build on an existing pool; the migrations are applied again.
    pub async fn with_pool(
        core: CoreConfig,
        config: CacheConfig,
        pool: SqlitePool,
    ) -> Result<Self> {
        core.validate()?;
        config.validate()?;

        let repository = Arc::new(SqliteCacheRepository::new(pool));
        repository.initialize().await?;

        let layout =
            CacheLayout::prepare(core.file_system.as_ref(), core.cache_root.as_deref(), &config)
                .await?;

        let events = EventBus::default();
        let locks = Arc::new(ItemLocks::new());

        let scheduler = core.transfer_client.as_ref().map(|client| {
            DownloadScheduler::new(
                Arc::clone(client),
                Arc::clone(&core.file_system),
                layout.staging_dir.clone(),
                config.max_concurrent_transfers,
            )
        });

        let mut builder = CacheOrchestrator::builder(
            repository.clone(),
            repository.clone(),
            Arc::clone(&core.file_system),
            layout.clone(),
        )
        .default_extension(config.default_extension.clone())
        .playback_monitor(Arc::clone(&core.playback_monitor))
        .clock(Arc::clone(&core.clock))
        .event_bus(events.clone())
        .item_locks(Arc::clone(&locks));

        if let Some(scheduler) = &scheduler {
            builder = builder.scheduler(scheduler.clone());
        }
        if let Some(session) = &core.background_session {
            builder = builder.background_session(Arc::clone(session), config.background_transfers);
        }
        let orchestrator = builder.build()?;

        let delegate = core.background_session.as_ref().map(|_| {
            TransferDelegateBridge::new(
                orchestrator.clone(),
                Arc::clone(&core.file_system),
                layout.staging_dir.clone(),
            )
        });

        let purger = Arc::new(CachePurger::new(
            repository.clone(),
            Arc::clone(&core.file_system),
            layout,
            Arc::clone(&core.playback_monitor),
            Arc::clone(&core.clock),
            events.clone(),
            locks,
            config.max_cache_size_bytes,
            config.staleness_threshold,
        ));

        let purge_task = core.background_executor.as_ref().map(|executor| {
            PurgeTask::new(Arc::clone(&purger), Arc::clone(executor), config.purge_interval)
        });

        info!(
            foreground = scheduler.is_some(),
            background = delegate.is_some(),
            scheduled_purge = purge_task.is_some(),
            "Episode cache engine built"
        );

        Ok(Self {
            core,
            config,
            repository,
            scheduler,
            orchestrator,
            delegate,
            purger,
            purge_task,
            queue: PlaybackQueue::new(),
            events,
            started: AtomicBool::new(false),
        })
    }

    /// Attach to the platform session, adopt surviving transfers, then
    /// reconcile and start mirroring the queue and register the periodic
    /// purge.
    ///
    /// Adoption runs before the queue is watched so a queued item whose
    /// transfer survived a restart is not fetched twice.
    pub async fn start(&self) -> Result<AdoptionReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Engine already started");
            return Ok(AdoptionReport::default());
        }

        self.orchestrator.start();

        let mut report = AdoptionReport::default();
        if let (Some(session), Some(delegate)) = (&self.core.background_session, &self.delegate) {
            let sink: Arc<dyn TransferEventSink> = Arc::new(delegate.clone());
            session.attach(sink).await?;
            report = match self.orchestrator.adopt_outstanding_transfers().await {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %err, "Startup adoption failed");
                    AdoptionReport::default()
                }
            };
        }

        if let Err(err) = self.orchestrator.reconcile_queue(&self.queue).await {
            warn!(error = %err, "Failed to reconcile queued flags");
        }
        self.orchestrator.watch_queue(&self.queue);

        if let Some(task) = &self.purge_task {
            if let Err(err) = task.register().await {
                warn!(error = %err, "Periodic purge not registered; purges run on demand only");
            }
        }

        info!("Episode cache engine started");
        Ok(report)
    }

    /// Register or refresh an item. Cache state already recorded is kept.
    pub async fn upsert_item(&self, item: &CacheableItem) -> Result<()> {
        self.repository.upsert(item).await
    }

    pub async fn request_cache(&self, item: &CacheableItem) -> Result<bool> {
        self.orchestrator.request_cache(item).await
    }

    pub async fn cancel_or_evict(&self, id: &ItemId) -> Result<CancelOrEvict> {
        self.orchestrator.cancel_or_evict(id).await
    }

    pub async fn set_pinned(&self, id: &ItemId, pinned: bool) -> Result<()> {
        self.repository.set_pinned(id, pinned).await
    }

    /// Record that the listener finished the item, or clear it with `None`.
    pub async fn set_finished_at(&self, id: &ItemId, finished_at: Option<i64>) -> Result<()> {
        self.repository.set_finished_at(id, finished_at).await
    }

    pub async fn purge_now(&self) -> Result<PurgeOutcome> {
        self.purger.purge().await
    }

    pub async fn cache_usage(&self) -> Result<u64> {
        self.purger.cache_usage().await
    }

    pub async fn cache_status(&self, id: &ItemId) -> Result<CacheStatus> {
        self.orchestrator.cache_status(id).await
    }

    pub async fn cached_path(&self, id: &ItemId) -> Result<Option<PathBuf>> {
        self.orchestrator.cached_path(id).await
    }

    pub fn progress(&self, id: &ItemId) -> watch::Receiver<Option<f64>> {
        self.orchestrator.progress(id)
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Sink to hand to the platform when it relaunches the app for
    /// background session events.
    pub fn delegate(&self) -> Option<&TransferDelegateBridge> {
        self.delegate.as_ref()
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator {
        &self.orchestrator
    }

    pub fn purger(&self) -> &Arc<CachePurger> {
        &self.purger
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn background_session(&self) -> Option<&Arc<dyn BackgroundTransferSession>> {
        self.core.background_session.as_ref()
    }

    /// Stop every worker. Background transfers keep running on the platform
    /// and are adopted on the next start.
    pub async fn shutdown(&self) {
        if let Some(task) = &self.purge_task {
            task.cancel_running();
        }
        if let Some(executor) = &self.core.background_executor {
            if let Err(err) = executor.cancel_task(&TaskId::new(PURGE_TASK_ID)).await {
                debug!(error = %err, "No scheduled purge to cancel");
            }
        }

        self.orchestrator.shutdown().await;
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        if let Some(delegate) = &self.delegate {
            delegate.shutdown().await;
        }
        info!("Episode cache engine shut down");
    }
}
