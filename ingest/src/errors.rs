use crate::config::ValidationError;
use crate::transport::ConnectionError;
use registry::{CredentialServiceError, IdentityStoreError, ProvisionError};
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors that can occur while ingesting telemetry or starting the ingest service
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("DeviceID is missing in the payload.")]
    MissingField,

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Admission gate closed")]
    AdmissionClosed(#[from] tokio::sync::AcquireError),

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Identity store error: {0}")]
    IdentityStore(#[from] IdentityStoreError),

    #[error("Credential service error: {0}")]
    CredentialService(#[from] CredentialServiceError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl IngestError {
    /// Whether the failure was caused by the request rather than by the gateway or its backends.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::MissingField | IngestError::InvalidBody(_) | IngestError::RequestBody(_)
        )
    }
}
