//! Post-download payload validation.
//!
//! A payload only counts as cached once it parses as audio. The validated
//! duration is persisted alongside the filename.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use lofty::config::ParseOptions;
use lofty::file::AudioFile;
use lofty::probe::Probe;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What validation learned about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPayload {
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait PayloadValidator: Send + Sync {
    /// Check that the file at `path` is playable.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotPlayable`] if the file cannot be parsed.
    async fn validate(&self, item_id: &str, path: &Path) -> Result<ValidatedPayload>;
}

/// Validator backed by `lofty` container probing.
#[derive(Debug, Clone, Copy)]
pub struct LoftyPayloadValidator {
    parse_options: ParseOptions,
}

impl Default for LoftyPayloadValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoftyPayloadValidator {
    pub fn new() -> Self {
        Self {
            parse_options: ParseOptions::new(),
        }
    }
}

#[async_trait]
impl PayloadValidator for LoftyPayloadValidator {
    async fn validate(&self, item_id: &str, path: &Path) -> Result<ValidatedPayload> {
        let path: PathBuf = path.to_path_buf();
        let options = self.parse_options;
        let not_playable = |reason: String| CacheError::NotPlayable {
            item_id: item_id.to_string(),
            reason,
        };

        // Probing reads the whole container; keep it off the async workers.
        let probed = core_async::task::spawn_blocking(move || {
            let tagged_file = Probe::open(&path)
                .map_err(|e| format!("Failed to open payload: {}", e))?
                .options(options)
                .guess_file_type()
                .map_err(|e| format!("Failed to probe payload: {}", e))?
                .read()
                .map_err(|e| format!("Failed to parse payload: {}", e))?;

            let duration = tagged_file.properties().duration();
            Ok::<_, String>(duration)
        })
        .await
        .map_err(|e| not_playable(format!("Validation task failed: {}", e)))?
        .map_err(not_playable)?;

        let duration_ms = u64::try_from(probed.as_millis()).ok().filter(|ms| *ms > 0);
        debug!(item_id, ?duration_ms, "Payload validated");

        Ok(ValidatedPayload { duration_ms })
    }
}
