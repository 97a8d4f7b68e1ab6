//! Agent endpoints
//!
//! An `AgentEndpoint` is the registration record the broker keeps for each
//! agent: which sink reaches it, where, and its liveness bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AgentId = String;

/// Sink used to reach an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process bounded queue drained with `receive`.
    InternalQueue,
    /// Live bidirectional channel (WebSocket gateway or any `PushChannel`).
    PushChannel,
    /// Outbound HTTP call to `address`.
    Webhook,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEndpoint {
    pub agent_id: AgentId,
    pub transport: TransportKind,
    /// Queue name, channel handle or URL depending on `transport`.
    pub address: String,
    pub capabilities: Vec<String>,
    /// Bound of the internal queue.
    pub max_concurrent_messages: usize,
    /// Deadline for webhook calls.
    pub timeout: Duration,
    /// Advisory only; the broker itself does not retry.
    pub retry_attempts: u32,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub message_count: u64,
    pub error_count: u64,
}

impl AgentEndpoint {
    pub fn new(
        agent_id: impl Into<String>,
        transport: TransportKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            transport,
            address: address.into(),
            capabilities: Vec::new(),
            max_concurrent_messages: 100,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            last_seen: Utc::now(),
            is_active: true,
            message_count: 0,
            error_count: 0,
        }
    }

    /// Endpoint served by an internal queue named after the agent.
    pub fn queue(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        let address = format!("queue:{agent_id}");
        Self::new(agent_id, TransportKind::InternalQueue, address)
    }

    /// Endpoint reached over a live push channel.
    pub fn push_channel(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        let address = format!("channel:{agent_id}");
        Self::new(agent_id, TransportKind::PushChannel, address)
    }

    pub fn webhook(agent_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(agent_id, TransportKind::Webhook, url)
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_capacity(mut self, max_concurrent_messages: usize) -> Self {
        self.max_concurrent_messages = max_concurrent_messages;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.is_active = true;
    }
}
