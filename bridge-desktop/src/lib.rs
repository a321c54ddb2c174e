//! # Desktop Bridge Implementations
//!
//! Default implementations of the bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `TransferClient` streaming to disk with `reqwest`
//! - `BackgroundTransferSession` running transfers on the Tokio runtime
//! - `FileSystemAccess` using `tokio::fs`
//! - `BackgroundExecutor` using Tokio timers
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopTransferSession, ReqwestTransferClient, TokioFileSystem};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Arc::new(ReqwestTransferClient::new());
//!     let session = DesktopTransferSession::new("desktop", client.clone(), "/tmp/transfers");
//!     let fs = TokioFileSystem::new();
//!
//!     // Hand these to CoreConfig::builder()
//! }
//! ```

mod background;
mod filesystem;
mod session;
mod transfer;

pub use background::TokioBackgroundExecutor;
pub use filesystem::TokioFileSystem;
pub use session::DesktopTransferSession;
pub use transfer::ReqwestTransferClient;
