//! Topic management
//!
//! A `Topic` holds the set of agent ids subscribed to one routing key.
//! `SubscriptionRegistry` owns all topics and drops a topic as soon as its
//! last subscriber leaves, so `topic_count` only counts live topics.
//!
//! Concurrency note: the registry is not synchronized itself; the broker
//! keeps it behind its own lock.

use std::collections::{BTreeSet, HashMap};

use crate::broker::endpoint::AgentId;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: BTreeSet<AgentId>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: BTreeSet::new(),
        }
    }

    /// Add a subscriber to the topic. Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: AgentId) -> bool {
        self.subscribers.insert(id)
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `agent_id` to `topic`, creating the topic if needed.
    pub fn subscribe(&mut self, topic: &str, agent_id: &str) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(agent_id.to_string())
    }

    /// Unsubscribe `agent_id` from `topic`; an emptied topic is removed.
    pub fn unsubscribe(&mut self, topic: &str, agent_id: &str) -> bool {
        let Some(t) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = t.unsubscribe(agent_id);
        if t.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Drop `agent_id` from every topic it belongs to.
    pub fn remove_agent(&mut self, agent_id: &str) {
        self.topics.retain(|_, t| {
            t.unsubscribe(agent_id);
            !t.is_empty()
        });
    }

    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
