use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure came from a missing file rather than a real I/O fault.
    pub fn is_not_found(&self) -> bool {
        match self {
            BridgeError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            BridgeError::TransferNotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
