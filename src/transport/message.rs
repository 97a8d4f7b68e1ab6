//! WebSocket gateway control frames.
//!
//! Control frames carry an `op` tag. Messages pushed by the broker are sent
//! as bare wire-form `Message` objects (see `broker::codec`) and carry no
//! `op` field, which is how a client tells the two apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Register {
        agent_id: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Heartbeat,
    /// `message` is the wire form produced by `codec::encode`.
    Send {
        message: Value,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        agent_id: String,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Alive,
    Ack {
        message_id: String,
        delivered: bool,
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}
