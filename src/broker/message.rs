//! Message definitions for the broker
//!
//! `Message` is the canonical unit exchanged between agents. It is immutable
//! after construction except for `delivered_at`, which the broker stamps on
//! the in-flight copy that reaches a sink.
//!
//! Notes on fields:
//! - `payload`: opaque JSON object; the broker never looks inside it
//! - `metadata`: transport-level annotations, kept apart from the payload
//! - `priority`: carried for consumers; queues stay FIFO regardless
//! - `routing_key`: defaults to `"<type>.<sender>"` and doubles as the
//!   multicast topic
//! - `ttl`: when set, `expires_at` is derived as `created_at + ttl`

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // task lifecycle
    TaskAssignment,
    TaskAccepted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    // agent lifecycle
    AgentRegistered,
    AgentStatus,
    AgentShutdown,
    // quality / review
    QualityCheck,
    ReviewRequest,
    ReviewResult,
    // domain sync
    CurriculumSync,
    ContentSync,
    // system coordination
    Coordination,
    ResourceRequest,
    SystemAlert,
    // live updates
    LiveUpdate,
    Broadcast,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignment => "task_assignment",
            Self::TaskAccepted => "task_accepted",
            Self::TaskProgress => "task_progress",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::AgentRegistered => "agent_registered",
            Self::AgentStatus => "agent_status",
            Self::AgentShutdown => "agent_shutdown",
            Self::QualityCheck => "quality_check",
            Self::ReviewRequest => "review_request",
            Self::ReviewResult => "review_result",
            Self::CurriculumSync => "curriculum_sync",
            Self::ContentSync => "content_sync",
            Self::Coordination => "coordination",
            Self::ResourceRequest => "resource_request",
            Self::SystemAlert => "system_alert",
            Self::LiveUpdate => "live_update",
            Self::Broadcast => "broadcast",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered priority, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Emergency,
}

/// How the recipient set of a message is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    FireAndForget,
    Guaranteed,
    RequestResponse,
    Broadcast,
    Multicast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: String,
    pub recipient: Option<String>,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    #[serde(default, with = "ttl_millis", rename = "ttl_ms")]
    pub ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub classification_tags: BTreeMap<String, String>,
}

impl Message {
    /// Create a fire-and-forget message with a fresh id and default routing key.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        let sender = sender.into();
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            routing_key: format!("{message_type}.{sender}"),
            sender,
            recipient: None,
            payload,
            metadata: Map::new(),
            priority: Priority::default(),
            delivery_mode: DeliveryMode::default(),
            ttl: None,
            created_at: Utc::now(),
            expires_at: None,
            delivered_at: None,
            reply_to: None,
            correlation_id: None,
            classification_tags: BTreeMap::new(),
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the time-to-live. Precision is milliseconds, matching the wire form.
    /// An explicit `expires_at` set earlier is kept.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(Duration::from_millis(ttl_millis::as_millis(ttl)));
        self.derive_expiry();
        self
    }

    /// Fill `expires_at` as `created_at + ttl` when a ttl is set and no
    /// explicit expiry is. A ttl too large to represent leaves it unset.
    pub(crate) fn derive_expiry(&mut self) {
        if self.expires_at.is_some() {
            return;
        }
        if let Some(ttl) = self.ttl {
            self.expires_at = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|d| self.created_at.checked_add_signed(d));
        }
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn with_tag(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.classification_tags.insert(kind.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark as a request: replies go to `reply_to` and carry `correlation_id`.
    pub fn expecting_reply(mut self, reply_to: impl Into<String>) -> Self {
        self.delivery_mode = DeliveryMode::RequestResponse;
        self.reply_to = Some(reply_to.into());
        if self.correlation_id.is_none() {
            self.correlation_id = Some(self.id.clone());
        }
        self
    }

    /// Build the response to a request-response message.
    pub fn reply(&self, sender: impl Into<String>, payload: Map<String, Value>) -> Message {
        let recipient = self.reply_to.clone().unwrap_or_else(|| self.sender.clone());
        let mut reply = Message::new(self.message_type, sender, payload)
            .to(recipient)
            .with_priority(self.priority)
            .with_mode(DeliveryMode::FireAndForget);
        reply.correlation_id = Some(
            self.correlation_id
                .clone()
                .unwrap_or_else(|| self.id.clone()),
        );
        reply
    }

    /// True iff `expires_at` is set and already in the past.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Copy addressed to a single agent, with a fresh id and fire-and-forget mode.
    pub(crate) fn fan_out_copy(&self, recipient: &str) -> Message {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.recipient = Some(recipient.to_string());
        copy.delivery_mode = DeliveryMode::FireAndForget;
        copy.delivered_at = None;
        copy
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Whole milliseconds, saturating at `u64::MAX`.
    pub fn as_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(d) => s.serialize_some(&as_millis(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
