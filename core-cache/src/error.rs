use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Transfer failed for {item_id}: {reason}")]
    TransferFailed { item_id: String, reason: String },

    #[error("Downloaded payload for {item_id} is not playable: {reason}")]
    NotPlayable { item_id: String, reason: String },

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache purge already running")]
    LockContention,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache engine not initialized: {0}")]
    NotInitialized(String),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Caching is queue driven, so transient failures are simply left for the
    /// next trigger.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::TransferFailed { .. } | CacheError::LockContention | CacheError::Cancelled
        )
    }

    pub(crate) fn file_system(context: &str, err: impl std::fmt::Display) -> Self {
        CacheError::FileSystem(format!("{context}: {err}"))
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::LockContention.is_transient());
        assert!(CacheError::TransferFailed {
            item_id: "ep-1".into(),
            reason: "connection reset".into(),
        }
        .is_transient());
        assert!(!CacheError::NotFound("ep-1".into()).is_transient());
        assert!(!CacheError::Database("locked".into()).is_transient());
    }

    #[test]
    fn test_bridge_error_conversion() {
        let err: CacheError = BridgeError::OperationFailed("disk full".into()).into();
        assert!(matches!(err, CacheError::Bridge(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
