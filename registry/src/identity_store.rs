//! Local ledger of provisioned devices, backed by Postgres.
use crate::config::{IdentityStoreConfig, ValidationError};
use crate::types::DeviceCredential;
use async_trait::async_trait;
use deadpool_postgres::{
    Config as PoolBuilder, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

// PostgreSQL error code for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

#[derive(thiserror::Error, Debug)]
pub enum IdentityStoreError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    #[error("device {0} already exists in the identity store")]
    Conflict(String),

    #[error("identity store query failed: {0}")]
    Query(String),

    #[error("identity store configuration error: {0}")]
    Config(String),
}

impl From<ValidationError> for IdentityStoreError {
    fn from(e: ValidationError) -> Self {
        IdentityStoreError::Config(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for IdentityStoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        IdentityStoreError::Unavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for IdentityStoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Errors without a server-side code never reached the database.
        match e.as_db_error() {
            Some(_) => IdentityStoreError::Query(e.to_string()),
            None => IdentityStoreError::Unavailable(e.to_string()),
        }
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Point lookup by device id.
    async fn lookup(&self, device_id: &str)
    -> Result<Option<DeviceCredential>, IdentityStoreError>;

    /// Inserts a credential inside a transaction. Rolled back on any failure.
    async fn insert(&self, credential: &DeviceCredential) -> Result<(), IdentityStoreError>;

    /// Verifies the store is reachable.
    async fn ping(&self) -> Result<(), IdentityStoreError>;

    /// Releases all connections. Called on shutdown.
    fn close(&self);
}

pub struct PostgresIdentityStore {
    pool: Pool,
}

impl PostgresIdentityStore {
    pub fn new(config: &IdentityStoreConfig) -> Result<Self, IdentityStoreError> {
        let mut builder = PoolBuilder::new();
        builder.url = Some(config.database_url()?);
        builder.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        builder.pool = Some(PoolConfig::new(config.max_pool_size));

        let pool = builder
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| IdentityStoreError::Config(e.to_string()))?;

        Ok(PostgresIdentityStore { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), IdentityStoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                primary_key TEXT NOT NULL,
                secondary_key TEXT
            )",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn lookup(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceCredential>, IdentityStoreError> {
        let conn = self.pool.get().await?;

        let row = conn
            .query_opt(
                "SELECT device_id, primary_key, secondary_key FROM devices WHERE device_id = $1",
                &[&device_id],
            )
            .await?;

        Ok(row.map(|row| {
            DeviceCredential::new(
                row.get::<_, String>(0),
                row.get::<_, String>(1),
                row.get(2),
            )
        }))
    }

    async fn insert(&self, credential: &DeviceCredential) -> Result<(), IdentityStoreError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let result = tx
            .execute(
                "INSERT INTO devices (device_id, primary_key, secondary_key) VALUES ($1, $2, $3)",
                &[
                    &credential.device_id,
                    &credential.primary_key,
                    &credential.secondary_key,
                ],
            )
            .await;

        if let Err(e) = result {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(device_id = %credential.device_id, "rollback failed: {rollback_err}");
            }
            if e
                .as_db_error()
                .is_some_and(|db_err| db_err.code().code() == UNIQUE_VIOLATION)
            {
                return Err(IdentityStoreError::Conflict(credential.device_id.clone()));
            }
            return Err(e.into());
        }

        tx.commit().await?;
        tracing::debug!(device_id = %credential.device_id, "inserted device into identity store");

        Ok(())
    }

    async fn ping(&self) -> Result<(), IdentityStoreError> {
        let conn = self.pool.get().await?;
        conn.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    fn close(&self) {
        self.pool.close();
    }
}
