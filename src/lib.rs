//! Workspace umbrella crate.
//!
//! Host applications depend on `episode-cache-workspace` to pull in the cache
//! engine and, with the default `desktop-shims` feature, the desktop bridge
//! adapters, without wiring each crate individually.

pub use core_cache as cache;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;
