//! Content-aware routing
//!
//! Resolves recipients from a message's classification tags (subject,
//! level, content type, ...) against the capabilities specialists declared.
//! The router only computes recipient sets; delivery always goes through
//! `MessageBroker::send`.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use crate::broker::endpoint::{AgentEndpoint, AgentId};
use crate::broker::engine::MessageBroker;
use crate::broker::message::Message;

/// Outcome of [`ContentRouter::dispatch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteSummary {
    pub delivered: Vec<AgentId>,
    pub failed: Vec<AgentId>,
}

/// tag kind -> tag value -> specialists
type CapabilityIndex = HashMap<String, HashMap<String, BTreeSet<AgentId>>>;

#[derive(Debug, Default)]
pub struct ContentRouter {
    index: RwLock<CapabilityIndex>,
}

impl ContentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `agent_id` handles messages tagged `tag_kind = tag_value`.
    /// Kinds and values are matched case-insensitively.
    pub fn register_specialist(&self, agent_id: &str, tag_kind: &str, tag_value: &str) {
        self.index
            .write()
            .entry(normalize(tag_kind))
            .or_default()
            .entry(normalize(tag_value))
            .or_default()
            .insert(agent_id.to_string());
    }

    /// Index every `kind:value` capability of an endpoint. Returns how many
    /// capabilities were indexed; plain tags without a kind are skipped.
    pub fn index_endpoint(&self, endpoint: &AgentEndpoint) -> usize {
        let mut indexed = 0;
        for capability in &endpoint.capabilities {
            if let Some((kind, value)) = capability.split_once(':') {
                if !kind.trim().is_empty() && !value.trim().is_empty() {
                    self.register_specialist(&endpoint.agent_id, kind, value);
                    indexed += 1;
                }
            }
        }
        indexed
    }

    pub fn unregister_specialist(&self, agent_id: &str) {
        let mut index = self.index.write();
        for values in index.values_mut() {
            values.retain(|_, agents| {
                agents.remove(agent_id);
                !agents.is_empty()
            });
        }
        index.retain(|_, values| !values.is_empty());
    }

    /// Union of specialists matching any tag of the message, minus the sender.
    pub fn resolve_recipients(&self, message: &Message) -> BTreeSet<AgentId> {
        let index = self.index.read();
        let mut recipients = BTreeSet::new();
        for (kind, value) in &message.classification_tags {
            if let Some(agents) = index
                .get(&normalize(kind))
                .and_then(|values| values.get(&normalize(value)))
            {
                recipients.extend(agents.iter().cloned());
            }
        }
        recipients.remove(&message.sender);
        recipients
    }

    /// Send one unicast copy of `message` to each resolved recipient.
    pub async fn dispatch(&self, broker: &MessageBroker, message: &Message) -> RouteSummary {
        let mut summary = RouteSummary::default();
        for recipient in self.resolve_recipients(message) {
            let copy = message.fan_out_copy(&recipient);
            if broker.send(copy).await {
                summary.delivered.push(recipient);
            } else {
                summary.failed.push(recipient);
            }
        }
        debug!(
            "Routed {} to {} specialists ({} failed)",
            message.id,
            summary.delivered.len(),
            summary.failed.len()
        );
        summary
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
