//! # Episode Cache Module
//!
//! Downloads episodic audio ahead of playback and keeps the local cache
//! within budget.
//!
//! ## Overview
//!
//! This module handles:
//! - Bounded, deduplicated foreground downloads ([`DownloadScheduler`])
//! - Caching decisions, commits and startup adoption of background
//!   transfers ([`CacheOrchestrator`])
//! - Platform background-transfer callbacks ([`TransferDelegateBridge`])
//! - Budget-driven eviction ([`CachePurger`], [`PurgeTask`])
//!
//! [`CacheEngine`] wires all of it together from a
//! [`CoreConfig`](core_runtime::config::CoreConfig).

pub mod config;
pub mod db;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod filename;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod purger;
pub mod queue;
mod release;
pub mod repository;
pub mod scheduler;
pub mod transfer;
pub mod validator;

pub use config::{CacheConfig, CacheLayout};
pub use delegate::TransferDelegateBridge;
pub use engine::CacheEngine;
pub use error::{CacheError, Result};
pub use models::{CacheStatus, CacheableItem, ItemId, TaskIdMapping};
pub use orchestrator::{AdoptionReport, CacheOrchestrator, CancelOrEvict, RetainReason};
pub use purger::{CachePurger, PurgeOutcome, PurgeReport, PurgeTask};
pub use queue::PlaybackQueue;
pub use repository::{CacheItemRepository, SqliteCacheRepository, TaskMappingRepository};
pub use scheduler::{DownloadScheduler, TransferEvent, TransferResult};
pub use transfer::{TransferOutcome, TransferState, TransferTask};
pub use validator::{LoftyPayloadValidator, PayloadValidator};
