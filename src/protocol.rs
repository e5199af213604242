//! Wire protocol for the hub WebSocket API
//!
//! The hub speaks JSON envelopes over a text WebSocket. Client commands
//! carry a session-assigned integer `id`; the server correlates responses
//! by echoing it. Builders here return [`serde_json::Value`] because the
//! session layer accepts arbitrary caller-supplied command objects and
//! injects the `id` itself.
//!
//! Inbound frames are either a single envelope or an array batch (hubs
//! coalesce messages once the capability is negotiated).

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::Result;

/// Reserved command id for the capability announcement sent during the
/// handshake. Precedes the session's own id space.
pub(crate) const CAPABILITY_MESSAGE_ID: u64 = 1;

/// First id handed out by a session. The counter resets here on every
/// reconnect, so ids restart at 2 on each new socket.
pub(crate) const FIRST_COMMAND_ID: u64 = 2;

/// One parsed server envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent by the hub as soon as the socket opens, before auth.
    AuthRequired {
        #[serde(default)]
        ha_version: String,
    },
    AuthOk {
        #[serde(default)]
        ha_version: String,
    },
    AuthInvalid {
        #[serde(default)]
        message: String,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Event {
        id: u64,
        event: Value,
    },
    Pong {
        id: u64,
    },
    /// Anything this client does not understand. Logged and skipped.
    #[serde(other)]
    Unknown,
}

/// Parse one text frame into envelopes, flattening array batches.
///
/// Batch members keep their wire order; the session dispatches them
/// strictly in sequence. A malformed member is skipped without taking
/// the rest of the batch down with it.
pub fn parse_frame(text: &str) -> Result<Vec<ServerMessage>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                match serde_json::from_value(item) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!(error = %e, "Skipping malformed envelope in batch"),
                }
            }
            Ok(messages)
        }
        value => Ok(vec![serde_json::from_value(value)?]),
    }
}

pub fn auth_message(access_token: &str) -> Value {
    json!({ "type": "auth", "access_token": access_token })
}

/// Capability announcement: ask the hub to coalesce messages into array
/// batches. Only understood by hubs at 2022.9 or newer.
pub fn supported_features_message() -> Value {
    json!({
        "type": "supported_features",
        "id": CAPABILITY_MESSAGE_ID,
        "features": { "coalesce_messages": 1 },
    })
}

pub fn get_states_message() -> Value {
    json!({ "type": "get_states" })
}

pub fn subscribe_events_message(event_type: Option<&str>) -> Value {
    match event_type {
        Some(event_type) => json!({ "type": "subscribe_events", "event_type": event_type }),
        None => json!({ "type": "subscribe_events" }),
    }
}

pub fn unsubscribe_events_message(subscription: u64) -> Value {
    json!({ "type": "unsubscribe_events", "subscription": subscription })
}

pub fn subscribe_entities_message() -> Value {
    json!({ "type": "subscribe_entities" })
}

pub fn ping_message() -> Value {
    json!({ "type": "ping" })
}

/// Compare a hub version string like `"2023.12.1"` against a minimum.
///
/// Segments that fail to parse count as zero, which keeps pre-release
/// suffixes (`"2022.9.0b3"`) from tripping the gate.
pub fn at_least_version(version: &str, major: u32, minor: u32, patch: u32) -> bool {
    let mut parts = version.splitn(3, '.');
    let mut next = || -> u32 {
        parts
            .next()
            .and_then(|part| part.parse().ok())
            .unwrap_or(0)
    };
    let (v_major, v_minor, v_patch) = (next(), next(), next());

    v_major > major
        || (v_major == major && v_minor > minor)
        || (v_major == major && v_minor == minor && v_patch >= patch)
}
