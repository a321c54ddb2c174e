//! Runtime-level errors raised while assembling the engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host bridge the engine needs was not injected.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    /// The tracing subscriber could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the host can fix this by injecting a bridge adapter.
    pub fn is_capability_missing(&self) -> bool {
        matches!(self, Error::CapabilityMissing { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_missing_message_names_bridge() {
        let err = Error::CapabilityMissing {
            capability: "FileSystemAccess".to_string(),
            message: "inject an adapter".to_string(),
        };
        assert!(err.is_capability_missing());
        assert_eq!(
            err.to_string(),
            "Capability missing: FileSystemAccess - inject an adapter"
        );
        assert!(!Error::Config("bad".to_string()).is_capability_missing());
    }
}
