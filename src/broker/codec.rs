//! Wire codec for [`Message`].
//!
//! The wire form is a flat JSON object holding every message field plus a
//! `schema_version`. Enum fields travel as their snake_case tag, timestamps
//! as RFC 3339 strings and the TTL as integer milliseconds (`ttl_ms`).
//! Decoding rejects unknown schema versions and unknown enum tags instead of
//! defaulting them. A decoded message carrying only `ttl_ms` gets its
//! `expires_at` derived from `created_at`, as on construction.

use serde_json::Value;

use crate::broker::message::Message;
use crate::utils::error::{BrokerError, Result};

pub const SCHEMA_VERSION: u32 = 1;
const VERSION_FIELD: &str = "schema_version";

/// Serialize a message to its versioned wire form.
pub fn encode(message: &Message) -> Result<String> {
    let mut value = serde_json::to_value(message)?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert(VERSION_FIELD.to_string(), Value::from(SCHEMA_VERSION));
        }
        None => {
            return Err(BrokerError::Codec(
                "message did not encode as an object".into(),
            ));
        }
    }
    Ok(serde_json::to_string(&value)?)
}

/// Parse the versioned wire form back into a message.
pub fn decode(text: &str) -> Result<Message> {
    let mut value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| BrokerError::Codec("expected a JSON object".into()))?;

    let version = obj
        .remove(VERSION_FIELD)
        .ok_or_else(|| BrokerError::Codec(format!("missing {VERSION_FIELD}")))?;
    let version = version
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BrokerError::Codec(format!("{VERSION_FIELD} must be an integer")))?;
    if version != SCHEMA_VERSION {
        return Err(BrokerError::UnsupportedSchema(version));
    }

    let mut message: Message = serde_json::from_value(value)?;
    message.derive_expiry();
    Ok(message)
}
