const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;

use crate::config::CredentialServiceConfig;
use crate::connection_string::{ConnectionStringError, ServiceConnectionString};
use crate::sas::{SasError, expiry_from_now, generate_sas_token};
use crate::types::DeviceCredential;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, IF_MATCH};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum CredentialServiceError {
    #[error("device {0} not found in the credential service")]
    NotFound(String),
    #[error("device {0} already exists in the credential service")]
    AlreadyExists(String),
    #[error("credential service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential service unavailable")]
    RetriesExceeded,
    #[error("credential service returned {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid credential service response: {0}")]
    InvalidResponse(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("could not sign request: {0}")]
    Signing(#[from] SasError),
    #[error("invalid connection string: {0}")]
    ConnectionString(#[from] ConnectionStringError),
}

impl CredentialServiceError {
    /// True when the service could not be reached at all, as opposed to answering with an error.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CredentialServiceError::Request(_) | CredentialServiceError::RetriesExceeded
        )
    }
}

/// The authoritative owner of device identities and their symmetric keys.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Fetches an existing identity. Fails with `NotFound` if there is none.
    async fn get(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError>;

    /// Registers a new, enabled identity with keys generated by the service.
    async fn create(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError>;

    /// Removes an identity. Removing an identity that does not exist succeeds.
    async fn delete(&self, device_id: &str) -> Result<(), CredentialServiceError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricKey {
    primary_key: Option<String>,
    secondary_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authentication {
    symmetric_key: Option<SymmetricKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    device_id: String,
    authentication: Authentication,
}

impl TryFrom<DeviceRecord> for DeviceCredential {
    type Error = CredentialServiceError;

    fn try_from(record: DeviceRecord) -> Result<Self, Self::Error> {
        let keys = record.authentication.symmetric_key.ok_or_else(|| {
            CredentialServiceError::InvalidResponse(format!(
                "device {} has no symmetric key",
                record.device_id
            ))
        })?;
        let primary_key = keys
            .primary_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                CredentialServiceError::InvalidResponse(format!(
                    "device {} has no primary key",
                    record.device_id
                ))
            })?;

        Ok(DeviceCredential::new(
            record.device_id,
            primary_key,
            keys.secondary_key,
        ))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewSymmetricKey {
    // Left null so the service generates both keys.
    primary_key: Option<String>,
    secondary_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewAuthentication {
    r#type: &'static str,
    symmetric_key: NewSymmetricKey,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceRequest<'a> {
    device_id: &'a str,
    status: &'static str,
    authentication: NewAuthentication,
}

/// REST client for the device registry.
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: Url,
    credentials: ServiceConnectionString,
    api_version: String,
    token_ttl: Duration,
    base_delay: Duration,
}

impl RegistryClient {
    pub fn new(config: &CredentialServiceConfig) -> Result<Self, CredentialServiceError> {
        let credentials = config.service_connection_string()?;

        let base_url = match &config.endpoint {
            Some(url) => url.clone(),
            None => Url::parse(&format!("https://{}/", credentials.host_name))
                .map_err(|e| CredentialServiceError::InvalidUrl(e.to_string()))?,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(RegistryClient {
            client,
            base_url,
            credentials,
            api_version: config.api_version.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
            base_delay: Duration::from_millis(BASE_DELAY),
        })
    }

    /// Overrides the delay before the first retry. Later retries double it.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn device_url(&self, device_id: &str) -> Result<Url, CredentialServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CredentialServiceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("devices")
            .push(device_id);
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    fn authorization(&self) -> Result<String, SasError> {
        generate_sas_token(
            &self.credentials.host_name,
            &self.credentials.shared_access_key,
            Some(&self.credentials.shared_access_key_name),
            expiry_from_now(self.token_ttl),
        )
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        body: Option<&CreateDeviceRequest<'_>>,
    ) -> Result<reqwest::Response, CredentialServiceError> {
        let mut retries = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(AUTHORIZATION, self.authorization()?);
            if let Some(body) = body {
                request = request.json(body);
            }
            if method == Method::DELETE {
                request = request.header(IF_MATCH, "*");
            }

            let response = request.send().await?;
            let status = response.status();

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Ok(response);
            }

            if retries >= MAX_RETRIES {
                return Err(CredentialServiceError::RetriesExceeded);
            }

            // Backoff between retries
            let delay = self.base_delay * 2_u32.pow(retries);
            tracing::warn!(
                %method,
                %status,
                retry = retries + 1,
                "credential service request failed, retrying in {delay:?}"
            );
            sleep(delay).await;
            retries += 1;
        }
    }

    async fn unexpected(response: reqwest::Response) -> CredentialServiceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CredentialServiceError::UnexpectedStatus { status, body }
    }

    async fn parse_device(
        response: reqwest::Response,
    ) -> Result<DeviceCredential, CredentialServiceError> {
        let record = response.json::<DeviceRecord>().await?;
        record.try_into()
    }
}

#[async_trait]
impl CredentialService for RegistryClient {
    async fn get(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError> {
        let url = self.device_url(device_id)?;
        let response = self.send_with_retry(Method::GET, url, None).await?;

        match response.status() {
            status if status.is_success() => Self::parse_device(response).await,
            StatusCode::NOT_FOUND => Err(CredentialServiceError::NotFound(device_id.to_string())),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn create(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError> {
        let url = self.device_url(device_id)?;
        let body = CreateDeviceRequest {
            device_id,
            status: "enabled",
            authentication: NewAuthentication {
                r#type: "sas",
                symmetric_key: NewSymmetricKey {
                    primary_key: None,
                    secondary_key: None,
                },
            },
        };
        let response = self.send_with_retry(Method::PUT, url, Some(&body)).await?;

        match response.status() {
            status if status.is_success() => Self::parse_device(response).await,
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Err(
                CredentialServiceError::AlreadyExists(device_id.to_string()),
            ),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn delete(&self, device_id: &str) -> Result<(), CredentialServiceError> {
        let url = self.device_url(device_id)?;
        let response = self.send_with_retry(Method::DELETE, url, None).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockRegistryServer;

    fn config_for(server: &MockRegistryServer) -> CredentialServiceConfig {
        CredentialServiceConfig {
            connection_string:
                "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0"
                    .into(),
            endpoint: Some(server.url()),
            api_version: "2021-04-12".into(),
            token_ttl_secs: 60,
            request_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let server = MockRegistryServer::spawn().await;
        let client = RegistryClient::new(&config_for(&server)).unwrap();

        assert!(matches!(
            client.get("dev-1").await,
            Err(CredentialServiceError::NotFound(_))
        ));

        let created = client.create("dev-1").await.unwrap();
        assert_eq!(created.device_id, "dev-1");
        assert!(created.secondary_key.is_some());

        let fetched = client.get("dev-1").await.unwrap();
        assert_eq!(fetched, created);

        assert!(matches!(
            client.create("dev-1").await,
            Err(CredentialServiceError::AlreadyExists(_))
        ));

        client.delete("dev-1").await.unwrap();
        client.delete("dev-1").await.unwrap();
        assert!(matches!(
            client.get("dev-1").await,
            Err(CredentialServiceError::NotFound(_))
        ));

        // Every request carried a signed service token and the api version.
        assert!(server.unauthorized_requests() == 0);
    }

    #[tokio::test]
    async fn test_retries_on_unavailable() {
        let server = MockRegistryServer::spawn().await;
        let client = RegistryClient::new(&config_for(&server))
            .unwrap()
            .with_base_delay(Duration::from_millis(1));

        // Two failures are absorbed by the retry loop.
        server.fail_next(2);
        assert!(client.create("dev-2").await.is_ok());
        assert_eq!(server.requests(), 3);

        // Four failures exceed the 3 retries.
        server.fail_next(4);
        assert!(matches!(
            client.get("dev-2").await,
            Err(CredentialServiceError::RetriesExceeded)
        ));
        assert_eq!(server.requests(), 7);
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let mut config = CredentialServiceConfig {
            connection_string:
                "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0"
                    .into(),
            endpoint: Some(Url::parse("http://127.0.0.1:1/").unwrap()),
            api_version: "2021-04-12".into(),
            token_ttl_secs: 60,
            request_timeout_secs: 1,
        };
        let client = RegistryClient::new(&config).unwrap();
        let err = client.get("dev-1").await.unwrap_err();
        assert!(err.is_unavailable());

        config.connection_string = "HostName=hub.example.net".into();
        assert!(matches!(
            RegistryClient::new(&config),
            Err(CredentialServiceError::ConnectionString(_))
        ));
    }

    #[test]
    fn test_device_url() {
        let config = CredentialServiceConfig {
            connection_string:
                "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0"
                    .into(),
            endpoint: None,
            api_version: "2021-04-12".into(),
            token_ttl_secs: 60,
            request_timeout_secs: 1,
        };
        let client = RegistryClient::new(&config).unwrap();
        assert_eq!(
            client.device_url("dev 1/a").unwrap().as_str(),
            "https://hub.example.net/devices/dev%201%2Fa?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_record_without_primary_key() {
        let record: DeviceRecord = serde_json::from_str(
            r#"{"deviceId": "dev-1", "authentication": {"symmetricKey": {"primaryKey": null}}}"#,
        )
        .unwrap();
        assert!(matches!(
            DeviceCredential::try_from(record),
            Err(CredentialServiceError::InvalidResponse(_))
        ));
    }
}
