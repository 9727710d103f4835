use crate::connection_string::{ConnectionStringError, ServiceConnectionString};
use serde::Deserialize;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("identity store url is not configured and DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("identity store pool size cannot be 0")]
    InvalidPoolSize,

    #[error("invalid credential service connection string: {0}")]
    InvalidConnectionString(#[from] ConnectionStringError),
}

/// Relational store holding one row per provisioned device.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IdentityStoreConfig {
    /// Postgres URL. Falls back to the `DATABASE_URL` environment variable.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Create the `devices` table on startup if it does not exist.
    #[serde(default = "default_true")]
    pub create_schema: bool,
}

impl Default for IdentityStoreConfig {
    fn default() -> Self {
        IdentityStoreConfig {
            url: None,
            max_pool_size: default_max_pool_size(),
            create_schema: true,
        }
    }
}

impl IdentityStoreConfig {
    pub fn database_url(&self) -> Result<String, ValidationError> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .filter(|url| !url.is_empty())
            .ok_or(ValidationError::MissingDatabaseUrl)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_pool_size == 0 {
            return Err(ValidationError::InvalidPoolSize);
        }
        self.database_url()?;
        Ok(())
    }
}

/// Remote registry that owns device identities and mints their keys.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CredentialServiceConfig {
    /// `HostName=...;SharedAccessKeyName=...;SharedAccessKey=...`
    pub connection_string: String,
    /// Overrides `https://{HostName}`. Mostly useful for pointing at a local test server.
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default = "default_registry_api_version")]
    pub api_version: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl CredentialServiceConfig {
    pub fn service_connection_string(
        &self,
    ) -> Result<ServiceConnectionString, ConnectionStringError> {
        self.connection_string.parse()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.service_connection_string()?;
        Ok(())
    }
}

/// What to do with an identity minted remotely when it could not be persisted locally.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Leave the remote identity in place and report it.
    #[default]
    Keep,
    /// Delete the remote identity again.
    Delete,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
}

fn default_true() -> bool {
    true
}

fn default_max_pool_size() -> usize {
    16
}

fn default_registry_api_version() -> String {
    "2021-04-12".into()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    10
}
