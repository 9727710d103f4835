use crate::config::{OrphanPolicy, ProvisionerConfig};
use crate::credential_service::{CredentialService, CredentialServiceError};
use crate::identity_store::{IdentityStore, IdentityStoreError};
use crate::metrics_defs::{
    IDENTITY_STORE_LOOKUP_FAILED, ORPHANED_IDENTITY, PROVISION_DURATION, PROVISION_RESULT,
};
use crate::types::{CredentialSource, DeviceCredential, Provisioned};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("identity store and credential service are both unavailable ({store}; {service})")]
    Unavailable {
        store: IdentityStoreError,
        service: CredentialServiceError,
    },

    #[error("credential service error: {0}")]
    CredentialService(#[from] CredentialServiceError),

    #[error("failed to persist identity for device {device_id}: {source}")]
    Persist {
        device_id: String,
        source: IdentityStoreError,
    },
}

/// Reconciles the identity store and the credential service into a single credential per device.
///
/// Lookups go local store first, then the credential service, and only then mint. The local
/// store is written only after the remote identity exists, so a local row always has a remote
/// counterpart with the same keys.
pub struct Provisioner {
    store: Arc<dyn IdentityStore>,
    credentials: Arc<dyn CredentialService>,
    orphan_policy: OrphanPolicy,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        credentials: Arc<dyn CredentialService>,
        config: &ProvisionerConfig,
    ) -> Self {
        Provisioner {
            store,
            credentials,
            orphan_policy: config.orphan_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn resolve_or_create(&self, device_id: &str) -> Result<Provisioned, ProvisionError> {
        let start = Instant::now();
        let result = self.resolve(device_id).await;
        histogram!(PROVISION_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(provisioned) => {
                counter!(PROVISION_RESULT, "source" => provisioned.source.as_str()).increment(1)
            }
            Err(_) => counter!(PROVISION_RESULT, "source" => "error").increment(1),
        }

        result
    }

    async fn resolve(&self, device_id: &str) -> Result<Provisioned, ProvisionError> {
        let store_error = match self.store.lookup(device_id).await {
            Ok(Some(credential)) => {
                tracing::info!(device_id, "device already exists in the identity store");
                return Ok(provisioned(credential, CredentialSource::IdentityStore));
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    device_id,
                    "identity store lookup failed, trying credential service: {e}"
                );
                counter!(IDENTITY_STORE_LOOKUP_FAILED).increment(1);
                Some(e)
            }
        };

        match self.credentials.get(device_id).await {
            Ok(credential) => {
                tracing::info!(device_id, "device already exists in the credential service");
                return Ok(provisioned(credential, CredentialSource::CredentialService));
            }
            Err(CredentialServiceError::NotFound(_)) => {
                tracing::info!(
                    device_id,
                    "device not found in the credential service, creating it"
                );
            }
            Err(service) => {
                return Err(match store_error {
                    Some(store) if service.is_unavailable() => {
                        ProvisionError::Unavailable { store, service }
                    }
                    _ => service.into(),
                });
            }
        }

        let minted = match self.credentials.create(device_id).await {
            Ok(credential) => credential,
            Err(CredentialServiceError::AlreadyExists(_)) => {
                // A concurrent first contact minted it between our get and create.
                tracing::info!(device_id, "device was created concurrently, fetching it");
                let credential = self.credentials.get(device_id).await?;
                return Ok(provisioned(credential, CredentialSource::CredentialService));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(device_id, "new device created in the credential service");

        self.persist(minted).await
    }

    async fn persist(&self, minted: DeviceCredential) -> Result<Provisioned, ProvisionError> {
        let device_id = minted.device_id.as_str();

        match self.store.insert(&minted).await {
            Ok(()) => {
                tracing::info!(device_id, "device inserted into the identity store");
                Ok(provisioned(minted, CredentialSource::Minted))
            }
            Err(IdentityStoreError::Conflict(_)) => {
                // Someone else persisted the row first; theirs is the one to use.
                match self.store.lookup(device_id).await {
                    Ok(Some(existing)) => {
                        tracing::info!(device_id, "device was persisted concurrently");
                        Ok(provisioned(existing, CredentialSource::IdentityStore))
                    }
                    Ok(None) => Err(ProvisionError::Persist {
                        device_id: device_id.to_string(),
                        source: IdentityStoreError::Conflict(device_id.to_string()),
                    }),
                    Err(source) => Err(ProvisionError::Persist {
                        device_id: device_id.to_string(),
                        source,
                    }),
                }
            }
            Err(source) => {
                tracing::error!(
                    device_id,
                    "error inserting device into the identity store: {source}"
                );
                self.handle_orphan(device_id).await;
                Err(ProvisionError::Persist {
                    device_id: device_id.to_string(),
                    source,
                })
            }
        }
    }

    async fn handle_orphan(&self, device_id: &str) {
        match self.orphan_policy {
            OrphanPolicy::Keep => {
                tracing::warn!(
                    device_id,
                    "identity exists in the credential service but not in the identity store"
                );
                counter!(ORPHANED_IDENTITY, "action" => "kept").increment(1);
            }
            OrphanPolicy::Delete => match self.credentials.delete(device_id).await {
                Ok(()) => {
                    tracing::warn!(
                        device_id,
                        "deleted unpersisted identity from the credential service"
                    );
                    counter!(ORPHANED_IDENTITY, "action" => "deleted").increment(1);
                }
                Err(e) => {
                    tracing::error!(device_id, "failed to delete unpersisted identity: {e}");
                    counter!(ORPHANED_IDENTITY, "action" => "delete_failed").increment(1);
                }
            },
        }
    }
}

fn provisioned(credential: DeviceCredential, source: CredentialSource) -> Provisioned {
    Provisioned { credential, source }
}
