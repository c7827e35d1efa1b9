//! Wire Envelope
//!
//! Text frames in both directions are UTF-8 JSON objects carrying a `type`
//! discriminator and an optional `data` payload:
//!
//! ```json
//! {"type": "gavage", "data": {"duck_id": 42, "dose_g": 180}}
//! ```
//!
//! Inbound frames are decoded into an [`Envelope`] stamped with the time of
//! receipt. Outbound frames are produced by [`encode`] or
//! [`OutboundMessage`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::error::DecodeError;

/// Subscription key that receives every message regardless of type
pub const WILDCARD: &str = "*";

/// Type of the keep-alive frame sent while the connection is open
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Type the server uses to acknowledge a heartbeat.
///
/// Dispatched like any other type.
pub const HEARTBEAT_ACK_TYPE: &str = "heartbeat_ack";

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Dispatch key
    pub msg_type: String,
    /// Type-specific payload (`null` when the frame had none)
    pub data: Value,
    /// When the frame was decoded
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope received now
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            received_at: Utc::now(),
        }
    }

    /// Decode a raw text frame
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(raw)? else {
            return Err(DecodeError::NotAnObject);
        };

        let msg_type = match fields.remove("type") {
            Some(Value::String(t)) if t.is_empty() => return Err(DecodeError::EmptyType),
            Some(Value::String(t)) => t,
            _ => return Err(DecodeError::MissingType),
        };

        let data = fields.remove("data").unwrap_or(Value::Null);

        Ok(Self::new(msg_type, data))
    }

    /// The full envelope as a JSON value, as handed to wildcard subscribers
    pub fn to_value(&self) -> Value {
        json!({
            "type": self.msg_type,
            "data": self.data,
            "receivedAt": self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

/// An outbound `{type, data}` frame
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub msg_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<'a, T: Serialize> OutboundMessage<'a, T> {
    pub fn new(msg_type: &'a str, data: T) -> Self {
        Self {
            msg_type,
            data: Some(data),
        }
    }
}

/// Serialize any payload into a text frame
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

/// The fixed-shape keep-alive frame: `{"type":"heartbeat"}`
pub fn heartbeat_frame() -> String {
    json!({ "type": HEARTBEAT_TYPE }).to_string()
}
