//! Runtime facade for the episode cache core.
//!
//! Every `core-*` and `bridge-*` crate reaches the async runtime through this
//! crate instead of naming Tokio directly. That keeps the executor choice in
//! one place and gives the workspace a single set of test/entry-point macros.
//!
//! # Modules
//!
//! - `task`: spawning and join handles
//! - `time`: sleep, timeout, instants
//! - `sync`: async mutexes, channels, cancellation tokens
//! - `runtime`: `block_on` and runtime handles
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(5)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

// Re-export the async entry-point/test macros so downstream crates never need
// direct Tokio dependencies.
pub use core_async_macros::{main, test};

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
