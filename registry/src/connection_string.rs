//! `Key=Value;Key=Value` connection strings for the registry and for individual devices.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectionStringError {
    #[error("malformed connection string segment: {0}")]
    MalformedSegment(String),
    #[error("connection string is missing {0}")]
    MissingField(&'static str),
}

fn parse_pairs(s: &str) -> Result<HashMap<&str, &str>, ConnectionStringError> {
    s.split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            // Keys are base64 and may end in '=', so only split on the first one.
            segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(segment.to_string()))
        })
        .collect()
}

fn required(
    pairs: &HashMap<&str, &str>,
    field: &'static str,
) -> Result<String, ConnectionStringError> {
    match pairs.get(field) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConnectionStringError::MissingField(field)),
    }
}

/// Service-level credentials used to manage device identities in the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceConnectionString {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: String,
}

impl FromStr for ServiceConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pairs = parse_pairs(s)?;
        Ok(ServiceConnectionString {
            host_name: required(&pairs, "HostName")?,
            shared_access_key_name: required(&pairs, "SharedAccessKeyName")?,
            shared_access_key: required(&pairs, "SharedAccessKey")?,
        })
    }
}

impl fmt::Debug for ServiceConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConnectionString")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .finish_non_exhaustive()
    }
}

/// Addresses one device on the ingestion service: host, device id and the device's key.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl DeviceConnectionString {
    pub fn new<H, D, K>(host_name: H, device_id: D, shared_access_key: K) -> Self
    where
        H: Into<String>,
        D: Into<String>,
        K: Into<String>,
    {
        DeviceConnectionString {
            host_name: host_name.into(),
            device_id: device_id.into(),
            shared_access_key: shared_access_key.into(),
        }
    }
}

impl fmt::Display for DeviceConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.host_name, self.device_id, self.shared_access_key
        )
    }
}

impl fmt::Debug for DeviceConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl FromStr for DeviceConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pairs = parse_pairs(s)?;
        Ok(DeviceConnectionString {
            host_name: required(&pairs, "HostName")?,
            device_id: required(&pairs, "DeviceId")?,
            shared_access_key: required(&pairs, "SharedAccessKey")?,
        })
    }
}
