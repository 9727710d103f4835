//! Device identity provisioning.
//!
//! Resolves a device id to its credential, consulting the local identity store first, then the
//! remote credential service, and minting a new identity only when neither knows the device.
pub mod config;
pub mod connection_string;
pub mod credential_service;
pub mod identity_store;
pub mod metrics_defs;
pub mod provisioner;
pub mod sas;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod types;

pub use credential_service::{CredentialService, CredentialServiceError, RegistryClient};
pub use identity_store::{IdentityStore, IdentityStoreError, PostgresIdentityStore};
pub use provisioner::{ProvisionError, Provisioner};
pub use types::{CredentialSource, DeviceCredential, Provisioned};
