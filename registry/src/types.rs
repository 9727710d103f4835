use std::fmt;

pub type DeviceId = String;

/// The key material identifying and authenticating one device to the ingestion service.
///
/// Created exactly once per device and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredential {
    pub device_id: DeviceId,
    pub primary_key: String,
    pub secondary_key: Option<String>,
}

impl DeviceCredential {
    pub fn new<I, P>(device_id: I, primary_key: P, secondary_key: Option<String>) -> Self
    where
        I: Into<String>,
        P: Into<String>,
    {
        DeviceCredential {
            device_id: device_id.into(),
            primary_key: primary_key.into(),
            // An empty secondary key is the same as none at all.
            secondary_key: secondary_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn keys(&self) -> (&str, Option<&str>) {
        (&self.primary_key, self.secondary_key.as_deref())
    }
}

// Keys never end up in logs.
impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("device_id", &self.device_id)
            .field("primary_key", &"<redacted>")
            .field(
                "secondary_key",
                &self.secondary_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Where a provisioned credential came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Row already present in the identity store.
    IdentityStore,
    /// Identity already registered with the credential service.
    CredentialService,
    /// Newly minted by the credential service and persisted locally.
    Minted,
}

impl CredentialSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::IdentityStore => "identity_store",
            CredentialSource::CredentialService => "credential_service",
            CredentialSource::Minted => "minted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provisioned {
    pub credential: DeviceCredential,
    pub source: CredentialSource,
}
