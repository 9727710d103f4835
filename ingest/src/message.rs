use serde_json::{Map, Value};

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";

/// One telemetry message sent on behalf of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub device_id: String,
    /// The JSON-encoded payload, exactly as received
    pub body: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl TelemetryMessage {
    pub fn from_payload(
        device_id: &str,
        payload: &Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        Ok(TelemetryMessage {
            device_id: device_id.to_string(),
            body: serde_json::to_string(payload)?,
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
        })
    }
}
