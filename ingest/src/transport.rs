//! Outbound connections from the gateway to the ingestion service, one per device.
use crate::config::TransportConfig;
use crate::message::TelemetryMessage;
use async_trait::async_trait;
use registry::connection_string::DeviceConnectionString;
use registry::sas::{SasError, expiry_from_now, generate_sas_token, validate_key};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const CONTENT_TYPE_PROPERTY: &str = "iothub-contenttype";
const CONTENT_ENCODING_PROPERTY: &str = "iothub-contentencoding";

/// Failure to construct a connection handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("malformed credential for device {device_id}: {reason}")]
    MalformedCredential { device_id: String, reason: String },

    #[error("failed to set up connection for device {device_id}: {reason}")]
    Setup { device_id: String, reason: String },
}

/// Failure of a single send attempt.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ingestion service rejected the message with {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("could not sign message: {0}")]
    Signing(#[from] SasError),

    #[error("dispatch task failed: {0}")]
    Task(String),
}

/// A live, reusable channel to the ingestion service for one device.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    async fn send(&self, message: &TelemetryMessage) -> Result<(), TransportError>;
}

/// Builds connection handles from a device connection string.
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        descriptor: &DeviceConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError>;
}

/// Connects devices over the HTTPS telemetry endpoint.
pub struct HttpsConnectionFactory {
    client: reqwest::Client,
    endpoint: Option<Url>,
    api_version: String,
    token_ttl: Duration,
}

impl HttpsConnectionFactory {
    pub fn new(config: &TransportConfig) -> Result<Self, reqwest::Error> {
        // One client (and its connection pool) is shared by every device handle.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(HttpsConnectionFactory {
            client,
            endpoint: config.endpoint.clone(),
            api_version: config.api_version.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
        })
    }

    fn events_url(&self, descriptor: &DeviceConnectionString) -> Result<Url, ConnectionError> {
        let setup_error = |reason: String| ConnectionError::Setup {
            device_id: descriptor.device_id.clone(),
            reason,
        };

        let mut url = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(&format!("https://{}/", descriptor.host_name))
                .map_err(|e| setup_error(e.to_string()))?,
        };
        let base = url.to_string();
        url.path_segments_mut()
            .map_err(|_| setup_error(format!("{base} cannot be a base URL")))?
            .pop_if_empty()
            .extend(["devices", descriptor.device_id.as_str(), "messages", "events"]);
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }
}

impl ConnectionFactory for HttpsConnectionFactory {
    fn connect(
        &self,
        descriptor: &DeviceConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        validate_key(&descriptor.shared_access_key).map_err(|e| {
            ConnectionError::MalformedCredential {
                device_id: descriptor.device_id.clone(),
                reason: e.to_string(),
            }
        })?;

        let url = self.events_url(descriptor)?;
        tracing::debug!(device_id = %descriptor.device_id, %url, "created device connection");

        Ok(Arc::new(HttpsDeviceConnection {
            client: self.client.clone(),
            url,
            resource_uri: format!("{}/devices/{}", descriptor.host_name, descriptor.device_id),
            key: descriptor.shared_access_key.clone(),
            token_ttl: self.token_ttl,
        }))
    }
}

pub struct HttpsDeviceConnection {
    client: reqwest::Client,
    url: Url,
    resource_uri: String,
    key: String,
    token_ttl: Duration,
}

#[async_trait]
impl DeviceConnection for HttpsDeviceConnection {
    async fn send(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        let token = generate_sas_token(
            &self.resource_uri,
            &self.key,
            None,
            expiry_from_now(self.token_ttl),
        )?;

        let response = self
            .client
            .post(self.url.clone())
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, message.content_type)
            .header(CONTENT_TYPE_PROPERTY, message.content_type)
            .header(CONTENT_ENCODING_PROPERTY, message.content_encoding)
            .body(message.body.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use registry::testutils::test_key;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Received {
        path: String,
        query: String,
        authorization: String,
        content_type: String,
        encoding_property: String,
        body: Bytes,
    }

    /// Records every request and answers with `status`.
    async fn spawn_events_server(
        status: hyper::StatusCode,
    ) -> (Url, Arc<Mutex<Vec<Received>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let log = log.clone();
                        async move {
                            let header = |name: &str| {
                                req.headers()
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .unwrap_or_default()
                                    .to_string()
                            };
                            let mut entry = Received {
                                path: req.uri().path().to_string(),
                                query: req.uri().query().unwrap_or_default().to_string(),
                                authorization: header("authorization"),
                                content_type: header("iothub-contenttype"),
                                encoding_property: header("iothub-contentencoding"),
                                body: Bytes::new(),
                            };
                            entry.body = req.into_body().collect().await.unwrap().to_bytes();
                            log.lock().unwrap().push(entry);

                            let mut response = Response::new(Full::new(Bytes::new()));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (
            Url::parse(&format!("http://{addr}/")).unwrap(),
            received,
        )
    }

    fn factory(endpoint: Url) -> HttpsConnectionFactory {
        HttpsConnectionFactory::new(&TransportConfig {
            endpoint: Some(endpoint),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_posts_event() {
        let (endpoint, received) = spawn_events_server(hyper::StatusCode::NO_CONTENT).await;
        let descriptor =
            DeviceConnectionString::new("hub.example.net", "dev-1", test_key("dev-1"));
        let connection = factory(endpoint).connect(&descriptor).unwrap();

        let payload = json!({"DeviceID": "dev-1", "temp": 21.5});
        let message = TelemetryMessage::from_payload("dev-1", payload.as_object().unwrap()).unwrap();
        connection.send(&message).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let request = &received[0];
        assert_eq!(request.path, "/devices/dev-1/messages/events");
        assert_eq!(request.query, "api-version=2020-03-13");
        assert!(
            request
                .authorization
                .starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev-1&sig=")
        );
        // Device tokens carry no policy name.
        assert!(!request.authorization.contains("&skn="));
        assert_eq!(request.content_type, "application/json");
        assert_eq!(request.encoding_property, "utf-8");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&request.body).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_rejected_send() {
        let (endpoint, _received) = spawn_events_server(hyper::StatusCode::UNAUTHORIZED).await;
        let descriptor =
            DeviceConnectionString::new("hub.example.net", "dev-1", test_key("dev-1"));
        let connection = factory(endpoint).connect(&descriptor).unwrap();

        let message =
            TelemetryMessage::from_payload("dev-1", json!({}).as_object().unwrap()).unwrap();
        let err = connection.send(&message).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected { status, .. } if status == StatusCode::UNAUTHORIZED
        ));
    }

    #[test]
    fn test_malformed_key_rejected() {
        let factory = HttpsConnectionFactory::new(&TransportConfig::default()).unwrap();

        for key in ["", "not base64!"] {
            let descriptor = DeviceConnectionString::new("hub.example.net", "dev-1", key);
            let err = factory.connect(&descriptor).err().unwrap();
            assert!(matches!(err, ConnectionError::MalformedCredential { .. }));
        }
    }

    #[test]
    fn test_endpoint_that_cannot_be_a_base() {
        let factory = HttpsConnectionFactory::new(&TransportConfig {
            endpoint: Some(Url::parse("mailto:ops@example.net").unwrap()),
            ..Default::default()
        })
        .unwrap();
        let descriptor = DeviceConnectionString::new("hub.example.net", "dev-1", test_key("k"));

        let err = factory.connect(&descriptor).err().unwrap();
        assert_eq!(
            err,
            ConnectionError::Setup {
                device_id: "dev-1".into(),
                reason: "mailto:ops@example.net cannot be a base URL".into(),
            }
        );
    }

    #[test]
    fn test_events_url_defaults_to_host() {
        let factory = HttpsConnectionFactory::new(&TransportConfig::default()).unwrap();
        let descriptor = DeviceConnectionString::new("hub.example.net", "dev 1", test_key("k"));
        assert_eq!(
            factory.events_url(&descriptor).unwrap().as_str(),
            "https://hub.example.net/devices/dev%201/messages/events?api-version=2020-03-13"
        );
    }
}
