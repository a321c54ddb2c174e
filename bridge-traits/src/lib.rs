//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the episode cache core and
//! platform-specific implementations. Each trait represents a capability the
//! core requires but that must be implemented differently per platform.
//!
//! ## Traits
//!
//! ### Transfers & I/O
//! - [`TransferClient`](transfer::TransferClient) - Foreground fetch into a local file
//! - [`BackgroundTransferSession`](transfer::BackgroundTransferSession) - Transfers that outlive the process
//! - [`TransferEventSink`](transfer::TransferEventSink) - Callback surface for background transfers
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Stat, move, delete, list
//!
//! ### Platform Integration
//! - [`BackgroundExecutor`](background::BackgroundExecutor) - Deferred task scheduling
//! - [`PlaybackMonitor`](playback::PlaybackMonitor) - "Is this item open in the player?"
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let file_system = config.file_system
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "FileSystemAccess".to_string(),
//!         message: "Desktop: enable the desktop-shims feature. \
//!                   Mobile: inject the platform adapter.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Platform
//! implementations should convert platform-specific errors to `BridgeError`
//! and include the path or task id involved.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod background;
pub mod error;
pub mod playback;
pub mod storage;
pub mod time;
pub mod transfer;

pub use error::BridgeError;

// Re-export commonly used types
pub use background::{BackgroundExecutor, TaskFuture, TaskHandler, TaskId, TaskStatus};
pub use playback::{NothingPlaying, PlaybackMonitor};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use transfer::{
    BackgroundTransferSession, TransferClient, TransferEventSink, TransferProgress,
};
