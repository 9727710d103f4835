//! Shared access signature tokens, as accepted by the registry and the ingestion service.
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

// Everything but the RFC 3986 unreserved characters, `/` included.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SasError {
    #[error("signing key is not valid base64: {0}")]
    InvalidKey(String),
}

/// Percent-encodes every byte outside the unreserved set, including `/`.
pub(crate) fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Seconds since the epoch `ttl` from now, for use as a token expiry.
pub fn expiry_from_now(ttl: Duration) -> u64 {
    SystemTime::now()
        .checked_add(ttl)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX)
}

/// Checks that `key` can be used to sign tokens.
pub fn validate_key(key: &str) -> Result<(), SasError> {
    decode_key(key).map(|_| ())
}

fn decode_key(key: &str) -> Result<Vec<u8>, SasError> {
    if key.is_empty() {
        return Err(SasError::InvalidKey("key is empty".into()));
    }
    BASE64_STANDARD
        .decode(key.as_bytes())
        .map_err(|e| SasError::InvalidKey(e.to_string()))
}

/// Builds a token of the form
/// `SharedAccessSignature sr={uri}&sig={signature}&se={expiry}[&skn={policy}]`.
///
/// The signature is an HMAC-SHA256 over `"{encoded uri}\n{expiry}"` keyed with the
/// base64-decoded `key`.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    policy_name: Option<&str>,
    expiry: u64,
) -> Result<String, SasError> {
    let encoded_uri = encode_component(resource_uri);
    let key = decode_key(key)?;

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| SasError::InvalidKey(e.to_string()))?;
    mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        encode_component(&signature)
    );
    if let Some(policy) = policy_name {
        token.push_str("&skn=");
        token.push_str(policy);
    }

    Ok(token)
}
