use crate::config::ConnectionCacheConfig;
use crate::metrics_defs::{CONNECTION_CACHE_HIT, CONNECTION_CACHE_MISS};
use crate::transport::{ConnectionError, ConnectionFactory, DeviceConnection};
use moka::future::Cache;
use registry::connection_string::DeviceConnectionString;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

/// Device id to live connection handle, shared by every request in the process.
///
/// Concurrent first sends for the same device construct a single handle. Failed
/// constructions are not cached, so the next send tries again.
pub struct ConnectionCache {
    host: String,
    factory: Arc<dyn ConnectionFactory>,
    connections: Cache<String, Arc<dyn DeviceConnection>>,
}

impl ConnectionCache {
    pub fn new(
        host: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: &ConnectionCacheConfig,
    ) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_capacity);
        if let Some(secs) = config.time_to_idle_secs {
            builder = builder.time_to_idle(Duration::from_secs(secs));
        }

        ConnectionCache {
            host: host.into(),
            factory,
            connections: builder.build(),
        }
    }

    /// Builds a fresh handle that is not stored in the cache.
    pub fn connect(
        &self,
        device_id: &str,
        primary_key: &str,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        let descriptor = DeviceConnectionString::new(self.host.as_str(), device_id, primary_key);
        self.factory.connect(&descriptor)
    }

    pub async fn get_or_create(
        &self,
        device_id: &str,
        primary_key: &str,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        let entry = self
            .connections
            .entry_by_ref(device_id)
            .or_try_insert_with(async { self.connect(device_id, primary_key) })
            .await
            .map_err(|e: Arc<ConnectionError>| e.as_ref().clone())?;

        if entry.is_fresh() {
            counter!(CONNECTION_CACHE_MISS).increment(1);
            tracing::info!(device_id, "created device connection");
        } else {
            counter!(CONNECTION_CACHE_HIT).increment(1);
            tracing::debug!(device_id, "reusing existing connection");
        }

        Ok(entry.into_value())
    }

    /// Drops the handle for `device_id`. The next send builds a new one.
    pub async fn invalidate(&self, device_id: &str) {
        self.connections.invalidate(device_id).await;
    }

    pub async fn len(&self) -> u64 {
        self.connections.run_pending_tasks().await;
        self.connections.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
