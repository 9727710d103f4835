use registry::config::{CredentialServiceConfig, IdentityStoreConfig, ProvisionerConfig};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Retry policy needs at least one attempt")]
    NoAttempts,

    #[error("Admission limit cannot be 0")]
    InvalidAdmissionLimit,

    #[error("Connection cache capacity cannot be 0")]
    InvalidCacheCapacity,

    #[error(transparent)]
    Registry(#[from] registry::config::ValidationError),
}

/// Ingestion gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for telemetry posted by devices
    pub listener: Listener,
    /// Listener for health and readiness probes
    pub admin_listener: Listener,
    pub identity_store: IdentityStoreConfig,
    pub credential_service: CredentialServiceConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub connection_cache: ConnectionCacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.identity_store.validate()?;
        self.credential_service.validate()?;
        self.connection_cache.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }

    /// Host of the ingestion service. Defaults to the registry host.
    pub fn transport_host(&self) -> Result<String, ValidationError> {
        match &self.transport.host {
            Some(host) => Ok(host.clone()),
            None => Ok(self
                .credential_service
                .service_connection_string()
                .map_err(registry::config::ValidationError::from)?
                .host_name),
        }
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Outbound connection to the ingestion service
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Service host identifier used in every device connection string
    #[serde(default)]
    pub host: Option<String>,
    /// Overrides `https://{host}` for the send endpoint
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default = "default_transport_api_version")]
    pub api_version: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: None,
            endpoint: None,
            api_version: default_transport_api_version(),
            token_ttl_secs: default_token_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConnectionCacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
    /// Evict connections unused for this long. Unset keeps them until capacity pressure.
    #[serde(default)]
    pub time_to_idle_secs: Option<u64>,
}

impl Default for ConnectionCacheConfig {
    fn default() -> Self {
        ConnectionCacheConfig {
            max_capacity: default_cache_capacity(),
            time_to_idle_secs: None,
        }
    }
}

impl ConnectionCacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_capacity == 0 {
            return Err(ValidationError::InvalidCacheCapacity);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Up to `max_attempts` sends, sleeping `base_delay_ms * 2^n` after the n-th failure.
    Bounded {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_base_delay_ms")]
        base_delay_ms: u64,
    },
    /// A single best-effort attempt.
    #[serde(rename = "none")]
    Disabled,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Bounded { max_attempts, .. } => *max_attempts,
            RetryPolicy::Disabled => 1,
        }
    }

    /// Delay after the failed attempt with 0-based index `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Bounded { base_delay_ms, .. } => {
                Duration::from_millis(base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt)))
            }
            RetryPolicy::Disabled => Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Reuse one connection per device instead of connecting for every send
    #[serde(default = "default_true")]
    pub caching: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Maximum simultaneous provision and send pipelines. `null` is unbounded.
    #[serde(default = "default_admission_limit")]
    pub admission_limit: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            caching: true,
            retry: RetryPolicy::default(),
            admission_limit: default_admission_limit(),
        }
    }
}

impl PipelineConfig {
    /// Fresh connection for every send, one attempt, no admission gate.
    pub fn per_send() -> Self {
        PipelineConfig {
            caching: false,
            retry: RetryPolicy::Disabled,
            admission_limit: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.retry.max_attempts() == 0 {
            return Err(ValidationError::NoAttempts);
        }
        if self.admission_limit == Some(0) {
            return Err(ValidationError::InvalidAdmissionLimit);
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_admission_limit() -> Option<usize> {
    Some(5)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_transport_api_version() -> String {
    "2020-03-13".into()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    10
}
