//! In-memory stand-ins for the identity store and the credential service.
use crate::credential_service::{CredentialService, CredentialServiceError};
use crate::identity_store::{IdentityStore, IdentityStoreError};
use crate::types::DeviceCredential;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A syntactically valid device key derived from `seed`.
pub fn test_key(seed: &str) -> String {
    BASE64_STANDARD.encode(seed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertFailure {
    Unavailable,
    Query,
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    rows: Mutex<HashMap<String, DeviceCredential>>,
    // Written just before the next insert runs, as if a concurrent request got there first.
    racing_row: Mutex<Option<DeviceCredential>>,
    insert_failure: Mutex<Option<InsertFailure>>,
    unavailable: AtomicBool,
    closed: AtomicBool,
    lookups: AtomicUsize,
    inserts: AtomicUsize,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(self, credential: DeviceCredential) -> Self {
        self.rows
            .lock()
            .unwrap()
            .insert(credential.device_id.clone(), credential);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, failure: Option<InsertFailure>) {
        *self.insert_failure.lock().unwrap() = failure;
    }

    pub fn race_next_insert(&self, credential: DeviceCredential) {
        *self.racing_row.lock().unwrap() = Some(credential);
    }

    pub fn row(&self, device_id: &str) -> Option<DeviceCredential> {
        self.rows.lock().unwrap().get(device_id).cloned()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn lookup(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceCredential>, IdentityStoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityStoreError::Unavailable("connection refused".into()));
        }
        Ok(self.row(device_id))
    }

    async fn insert(&self, credential: &DeviceCredential) -> Result<(), IdentityStoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityStoreError::Unavailable("connection refused".into()));
        }
        match *self.insert_failure.lock().unwrap() {
            Some(InsertFailure::Unavailable) => {
                return Err(IdentityStoreError::Unavailable("connection reset".into()));
            }
            Some(InsertFailure::Query) => {
                return Err(IdentityStoreError::Query("disk full".into()));
            }
            None => {}
        }

        let mut rows = self.rows.lock().unwrap();
        if let Some(racing) = self.racing_row.lock().unwrap().take() {
            rows.insert(racing.device_id.clone(), racing);
        }
        if rows.contains_key(&credential.device_id) {
            return Err(IdentityStoreError::Conflict(credential.device_id.clone()));
        }
        rows.insert(credential.device_id.clone(), credential.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), IdentityStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityStoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCredentialService {
    identities: Mutex<HashMap<String, DeviceCredential>>,
    // Registered just before the next create runs, as if a concurrent request got there first.
    racing_identity: Mutex<Option<DeviceCredential>>,
    unavailable: AtomicBool,
    minted: AtomicUsize,
    gets: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl FakeCredentialService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(self, credential: DeviceCredential) -> Self {
        self.identities
            .lock()
            .unwrap()
            .insert(credential.device_id.clone(), credential);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn race_next_create(&self, credential: DeviceCredential) {
        *self.racing_identity.lock().unwrap() = Some(credential);
    }

    pub fn identity(&self, device_id: &str) -> Option<DeviceCredential> {
        self.identities.lock().unwrap().get(device_id).cloned()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), CredentialServiceError> {
        match self.unavailable.load(Ordering::SeqCst) {
            true => Err(CredentialServiceError::RetriesExceeded),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl CredentialService for FakeCredentialService {
    async fn get(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.identity(device_id)
            .ok_or_else(|| CredentialServiceError::NotFound(device_id.to_string()))
    }

    async fn create(&self, device_id: &str) -> Result<DeviceCredential, CredentialServiceError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut identities = self.identities.lock().unwrap();
        if let Some(racing) = self.racing_identity.lock().unwrap().take() {
            identities.insert(racing.device_id.clone(), racing);
        }
        if identities.contains_key(device_id) {
            return Err(CredentialServiceError::AlreadyExists(device_id.to_string()));
        }

        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        let credential = DeviceCredential::new(
            device_id,
            test_key(&format!("{device_id}:primary:{n}")),
            Some(test_key(&format!("{device_id}:secondary:{n}"))),
        );
        identities.insert(device_id.to_string(), credential.clone());
        Ok(credential)
    }

    async fn delete(&self, device_id: &str) -> Result<(), CredentialServiceError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.identities.lock().unwrap().remove(device_id);
        Ok(())
    }
}

#[cfg(test)]
pub use mock_server::MockRegistryServer;
