use crate::config::{ConnectionCacheConfig, PipelineConfig};
use crate::connection_cache::ConnectionCache;
use crate::message::TelemetryMessage;
use crate::pipeline::Pipeline;
use crate::transport::{ConnectionError, ConnectionFactory, DeviceConnection, TransportError};
use async_trait::async_trait;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use registry::Provisioner;
use registry::config::ProvisionerConfig;
use registry::connection_string::DeviceConnectionString;
use registry::testutils::{FakeCredentialService, InMemoryIdentityStore};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// One send attempt seen by a scripted connection.
#[derive(Clone, Debug)]
pub struct SendAttempt {
    pub message: TelemetryMessage,
    pub at: Instant,
    pub ok: bool,
}

#[derive(Default)]
struct SendScript {
    connects: AtomicUsize,
    fail_connects: AtomicBool,
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    delay: Mutex<Duration>,
    attempts: Mutex<Vec<SendAttempt>>,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
}

/// Hands out connections that succeed or fail according to a shared script.
#[derive(Clone, Default)]
pub struct FakeConnectionFactory {
    script: Arc<SendScript>,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` sends fail, across all devices.
    pub fn fail_first(&self, n: usize) {
        self.script.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self, fail: bool) {
        self.script.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.script.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// How long every send takes.
    pub fn set_delay(&self, delay: Duration) {
        *self.script.delay.lock().unwrap() = delay;
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<SendAttempt> {
        self.script.attempts.lock().unwrap().clone()
    }

    /// Highest number of sends observed in flight at once.
    pub fn max_inflight(&self) -> usize {
        self.script.max_inflight.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn connect(
        &self,
        descriptor: &DeviceConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_connects.load(Ordering::SeqCst) {
            return Err(ConnectionError::Setup {
                device_id: descriptor.device_id.clone(),
                reason: "scripted connect failure".into(),
            });
        }
        Ok(Arc::new(ScriptedConnection {
            script: self.script.clone(),
        }))
    }
}

pub struct ScriptedConnection {
    script: Arc<SendScript>,
}

#[async_trait]
impl DeviceConnection for ScriptedConnection {
    async fn send(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        let inflight = self.script.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_inflight.fetch_max(inflight, Ordering::SeqCst);

        let at = Instant::now();
        let delay = *self.script.delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let ok = !self.script.always_fail.load(Ordering::SeqCst)
            && self
                .script
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();

        self.script.inflight.fetch_sub(1, Ordering::SeqCst);
        self.script.attempts.lock().unwrap().push(SendAttempt {
            message: message.clone(),
            at,
            ok,
        });

        match ok {
            true => Ok(()),
            false => Err(TransportError::Rejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "scripted send failure".into(),
            }),
        }
    }
}

/// A pipeline wired to in-memory fakes, with handles on each fake.
pub struct PipelineHarness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<InMemoryIdentityStore>,
    pub credentials: Arc<FakeCredentialService>,
    pub factory: FakeConnectionFactory,
}

pub fn pipeline_harness(config: &PipelineConfig) -> PipelineHarness {
    let store = Arc::new(InMemoryIdentityStore::new());
    let credentials = Arc::new(FakeCredentialService::new());
    let factory = FakeConnectionFactory::new();

    let provisioner = Provisioner::new(
        store.clone(),
        credentials.clone(),
        &ProvisionerConfig::default(),
    );
    let connections = ConnectionCache::new(
        "hub.example.net",
        Arc::new(factory.clone()),
        &ConnectionCacheConfig::default(),
    );

    PipelineHarness {
        pipeline: Arc::new(Pipeline::new(Arc::new(provisioner), connections, config)),
        store,
        credentials,
        factory,
    }
}

/// Records gauges in memory so tests can read them back. Other metric kinds are dropped.
#[derive(Default)]
pub struct GaugeRecorder {
    gauges: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl GaugeRecorder {
    pub fn value(&self, name: &str) -> f64 {
        self.gauges
            .lock()
            .unwrap()
            .get(name)
            .map_or(0.0, |gauge| f64::from_bits(gauge.load(Ordering::SeqCst)))
    }
}

impl Recorder for GaugeRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, _key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let gauge = self
            .gauges
            .lock()
            .unwrap()
            .entry(key.name().to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0.0_f64.to_bits())))
            .clone();
        Gauge::from_arc(gauge)
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}
