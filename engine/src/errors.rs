//! Error types for the Shipyard engine

use thiserror::Error;

/// Main error type for the Shipyard engine
#[derive(Error, Debug)]
pub enum ShipyardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Invalid transition: {0}")]
    TransitionError(String),

    #[error("Lease error: {0}")]
    LeaseError(String),

    #[error("Activation error: {0}")]
    ActivationError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Signature error: {0}")]
    SignatureError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ShipyardError {
    fn from(err: anyhow::Error) -> Self {
        ShipyardError::Internal(err.to_string())
    }
}

/// Failure of a call to a remote collaborator (object store, runtime, edge, callbacks)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network blip, timeout or 5xx: worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Definitive rejection (4xx or malformed response): never retried
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classify a reqwest failure that happened before a status was received
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            RemoteError::Rejected {
                status: 0,
                message: err.to_string(),
            }
        } else {
            RemoteError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 408 || status == 429 || status >= 500 {
            RemoteError::Transient(format!("{}: {}", status, body))
        } else {
            RemoteError::Rejected {
                status,
                message: body,
            }
        }
    }
}

impl From<RemoteError> for ShipyardError {
    fn from(err: RemoteError) -> Self {
        ShipyardError::StorageError(err.to_string())
    }
}
