//! Telemetry ingestion: accepts device payloads over HTTP, provisions the device and forwards
//! the payload to the ingestion service through a per-device connection.
pub mod config;
pub mod connection_cache;
pub mod errors;
pub mod message;
pub mod metrics_defs;
pub mod pipeline;
pub mod service;
#[cfg(test)]
mod testutils;
pub mod transport;

use crate::config::Config;
use crate::connection_cache::ConnectionCache;
use crate::errors::{IngestError, Result};
use crate::pipeline::Pipeline;
use crate::service::IngestService;
use crate::transport::HttpsConnectionFactory;
use registry::{IdentityStore, PostgresIdentityStore, Provisioner, RegistryClient};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

const MAX_STORE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Serves the ingestion and admin listeners until either fails or `shutdown` resolves.
///
/// The identity store pool is closed before returning.
pub async fn run<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    config.validate()?;

    let store = Arc::new(PostgresIdentityStore::new(&config.identity_store)?);
    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(prepare_store(
        store.clone(),
        config.identity_store.create_schema,
        ready.clone(),
    ));

    let credentials = Arc::new(RegistryClient::new(&config.credential_service)?);
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        credentials,
        &config.provisioner,
    ));

    let factory = Arc::new(HttpsConnectionFactory::new(&config.transport)?);
    let connections =
        ConnectionCache::new(config.transport_host()?, factory, &config.connection_cache);
    let pipeline = Arc::new(Pipeline::new(provisioner, connections, &config.pipeline));

    let ingest_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        IngestService::new(pipeline),
    );
    let admin_service = AdminService::new(move || ready.load(Ordering::Relaxed));
    let admin_task = run_http_service::<_, IngestError>(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tracing::info!("ingest gateway started");

    let result = tokio::select! {
        result = async { tokio::try_join!(ingest_task, admin_task).map(|_| ()) } => result,
        _ = shutdown => {
            tracing::info!("shutting down, closing identity store connections");
            Ok(())
        }
    };

    store.close();
    result
}

/// Waits for the identity store to answer, creating the schema if asked to, then flags readiness.
async fn prepare_store(
    store: Arc<PostgresIdentityStore>,
    create_schema: bool,
    ready: Arc<AtomicBool>,
) {
    let mut delay = Duration::from_secs(1);

    loop {
        let result = match create_schema {
            true => store.ensure_schema().await,
            false => store.ping().await,
        };

        match result {
            Ok(()) => {
                tracing::info!("identity store ready");
                ready.store(true, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!("identity store not ready, retrying in {delay:?}: {e}");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_STORE_RETRY_DELAY);
            }
        }
    }
}
