//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the episode cache core:
//! - Logging and tracing infrastructure
//! - Configuration management (injected host bridges)
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the cache engine depends on.
//! It establishes the logging conventions, the dependency-injection surface
//! and the event broadcasting mechanism used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
