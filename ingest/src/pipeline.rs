use crate::config::{PipelineConfig, RetryPolicy};
use crate::connection_cache::ConnectionCache;
use crate::errors::Result;
use crate::message::TelemetryMessage;
use crate::metrics_defs::{DELIVERY_EXHAUSTED, PIPELINES_INFLIGHT, SEND_ATTEMPTS, SEND_LATENCY};
use crate::transport::{ConnectionError, DeviceConnection, TransportError};
use registry::{DeviceCredential, Provisioner};
use serde_json::{Map, Value};
use shared::metrics_defs::MetricDef;
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};

/// How a send ended once the retry policy ran out or a send went through.
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    Delivered { attempts: u32, latency_ms: f64 },
    /// Every attempt failed. The device is still provisioned.
    NotDelivered { attempts: u32, error: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SendOutcome::Delivered { attempts, .. } | SendOutcome::NotDelivered { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Holds an inflight gauge up by one until dropped, even when the owning future is cancelled.
pub(crate) struct InflightGuard(MetricDef);

impl InflightGuard {
    pub(crate) fn new(def: MetricDef) -> Self {
        gauge!(def).increment(1.0);
        InflightGuard(def)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(self.0).decrement(1.0);
    }
}

/// Provisions the device, obtains a connection for it and delivers one message.
pub struct Pipeline {
    provisioner: Arc<Provisioner>,
    connections: ConnectionCache,
    caching: bool,
    retry: RetryPolicy,
    admission: Option<Semaphore>,
}

impl Pipeline {
    pub fn new(
        provisioner: Arc<Provisioner>,
        connections: ConnectionCache,
        config: &PipelineConfig,
    ) -> Self {
        Pipeline {
            provisioner,
            connections,
            caching: config.caching,
            retry: config.retry.clone(),
            admission: config.admission_limit.map(Semaphore::new),
        }
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    /// Runs the full pipeline for one inbound payload.
    ///
    /// Waits for an admission permit first when a limit is configured. Provisioning and
    /// connection failures are errors; a message that could not be delivered is not.
    pub async fn process(
        &self,
        device_id: &str,
        payload: &Map<String, Value>,
    ) -> Result<SendOutcome> {
        let _permit = match &self.admission {
            Some(gate) => Some(gate.acquire().await?),
            None => None,
        };
        let _inflight = InflightGuard::new(PIPELINES_INFLIGHT);

        let provisioned = self.provisioner.resolve_or_create(device_id).await?;
        tracing::debug!(
            device_id,
            source = provisioned.source.as_str(),
            "device credential resolved"
        );

        let message = TelemetryMessage::from_payload(device_id, payload)?;
        let connection = self.connection(&provisioned.credential).await?;
        Ok(self.send(connection, message).await)
    }

    async fn connection(
        &self,
        credential: &DeviceCredential,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        match self.caching {
            true => {
                self.connections
                    .get_or_create(&credential.device_id, &credential.primary_key)
                    .await
            }
            false => self
                .connections
                .connect(&credential.device_id, &credential.primary_key),
        }
    }

    /// Sends `message` through `connection`, retrying on failure without reconnecting.
    pub async fn send(
        &self,
        connection: Arc<dyn DeviceConnection>,
        message: TelemetryMessage,
    ) -> SendOutcome {
        let max_attempts = self.retry.max_attempts();
        let message = Arc::new(message);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match dispatch(connection.clone(), message.clone()).await {
                Ok(latency_ms) => {
                    counter!(SEND_ATTEMPTS, "result" => "ok").increment(1);
                    histogram!(SEND_LATENCY).record(latency_ms);
                    tracing::info!(
                        device_id = %message.device_id,
                        attempt,
                        latency_ms,
                        "data sent successfully, latency {latency_ms:.2} ms"
                    );
                    return SendOutcome::Delivered {
                        attempts: attempt,
                        latency_ms,
                    };
                }
                Err(error) => {
                    counter!(SEND_ATTEMPTS, "result" => "error").increment(1);

                    if attempt >= max_attempts {
                        tracing::error!(
                            device_id = %message.device_id,
                            attempt,
                            "failed to send data after {max_attempts} attempts: {error}"
                        );
                        counter!(DELIVERY_EXHAUSTED).increment(1);
                        return SendOutcome::NotDelivered {
                            attempts: attempt,
                            error: error.to_string(),
                        };
                    }

                    let delay = self.retry.backoff(attempt - 1);
                    tracing::warn!(
                        device_id = %message.device_id,
                        attempt,
                        "send failed, retrying in {delay:?} ({attempt}/{max_attempts}): {error}"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Runs one send on its own task and returns its latency in milliseconds.
async fn dispatch(
    connection: Arc<dyn DeviceConnection>,
    message: Arc<TelemetryMessage>,
) -> Result<f64, TransportError> {
    tokio::spawn(async move {
        let start = Instant::now();
        connection.send(&message).await?;
        Ok::<_, TransportError>(start.elapsed().as_secs_f64() * 1000.0)
    })
    .await
    .map_err(|e| TransportError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IngestError;
    use crate::testutils::pipeline_harness as harness;
    use serde_json::json;
    use std::time::Duration;

    fn payload(device_id: &str) -> Map<String, Value> {
        json!({"DeviceID": device_id, "temp": 21.5})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_new_device_end_to_end() {
        let h = harness(&PipelineConfig::default());

        let outcome = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts(), 1);

        assert_eq!(h.credentials.creates(), 1);
        assert_eq!(h.store.inserts(), 1);
        assert!(h.store.row("dev-1").is_some());

        let attempts = h.factory.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].message.device_id, "dev-1");
        assert_eq!(attempts[0].message.content_type, "application/json");
        assert_eq!(attempts[0].message.content_encoding, "utf-8");
    }

    #[tokio::test]
    async fn test_connection_reused_across_sends() {
        let h = harness(&PipelineConfig::default());

        for _ in 0..3 {
            h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        }

        assert_eq!(h.factory.connects(), 1);
        assert_eq!(h.factory.attempts().len(), 3);
        assert_eq!(h.credentials.creates(), 1);
        assert_eq!(h.pipeline.connections().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff() {
        let h = harness(&PipelineConfig::default());
        h.factory.fail_first(2);

        let outcome = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts(), 3);

        let attempts = h.factory.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.ok).collect::<Vec<_>>(),
            vec![false, false, true]
        );

        let first_gap = attempts[1].at - attempts[0].at;
        let second_gap = attempts[2].at - attempts[1].at;
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));

        // Retries go through the same connection.
        assert_eq!(h.factory.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_not_an_error() {
        let h = harness(&PipelineConfig::default());
        h.factory.always_fail(true);

        let outcome = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        let SendOutcome::NotDelivered { attempts, error } = outcome else {
            panic!("expected exhaustion, got {outcome:?}");
        };
        assert_eq!(attempts, 3);
        assert!(error.contains("503"), "{error}");
        assert_eq!(h.factory.attempts().len(), 3);
        assert!(h.store.row("dev-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_measures_dispatch() {
        let h = harness(&PipelineConfig::default());
        h.factory.set_delay(Duration::from_millis(250));

        let outcome = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        let SendOutcome::Delivered { latency_ms, .. } = outcome else {
            panic!("expected delivery, got {outcome:?}");
        };
        assert!((250.0..300.0).contains(&latency_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_limit() {
        let config = PipelineConfig {
            admission_limit: Some(2),
            ..Default::default()
        };
        let h = harness(&config);
        h.factory.set_delay(Duration::from_millis(100));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    let device_id = format!("dev-{i}");
                    pipeline.process(&device_id, &payload(&device_id)).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_delivered());
        }

        assert_eq!(h.factory.attempts().len(), 8);
        assert_eq!(h.factory.max_inflight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_admission() {
        let config = PipelineConfig {
            admission_limit: None,
            ..Default::default()
        };
        let h = harness(&config);
        h.factory.set_delay(Duration::from_millis(100));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    let device_id = format!("dev-{i}");
                    pipeline.process(&device_id, &payload(&device_id)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.factory.max_inflight(), 8);
    }

    #[tokio::test]
    async fn test_per_send_connections() {
        let h = harness(&PipelineConfig::per_send());

        h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        assert_eq!(h.factory.connects(), 2);
        assert!(h.pipeline.connections().is_empty().await);

        // A single best-effort attempt.
        h.factory.always_fail(true);
        let outcome = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap();
        assert!(matches!(
            outcome,
            SendOutcome::NotDelivered { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_an_error() {
        let h = harness(&PipelineConfig::default());
        h.store.set_unavailable(true);
        h.credentials.set_unavailable(true);

        let err = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap_err();
        assert!(matches!(err, IngestError::Provision(_)));
        assert!(h.factory.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_is_an_error() {
        let h = harness(&PipelineConfig::default());
        h.factory.fail_connects(true);

        let err = h.pipeline.process("dev-1", &payload("dev-1")).await.unwrap_err();
        assert!(matches!(err, IngestError::Connection(_)));
    }
}
