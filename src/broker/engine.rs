//! Broker engine
//!
//! `MessageBroker` owns the endpoint registry, one bounded queue per
//! queue-backed agent, the live push channels, the subscription registry,
//! the middleware stack and the statistics. It is shared as
//! `Arc<MessageBroker>`; every method takes `&self`.
//!
//! Concurrency and usage notes:
//! - Each registry sits behind its own `parking_lot` lock and each agent
//!   queue has its own lock, so congestion on one agent never blocks
//!   another. Locks are never held across an `.await`.
//! - `receive` is the only call that may wait, and only up to its timeout.
//!   Everything else fails fast instead of waiting for capacity.
//! - Failed deliveries never surface as errors from `send`: they become a
//!   `false` result, a failure record and (optionally) a dead letter.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::codec;
use crate::broker::endpoint::{AgentEndpoint, AgentId, TransportKind};
use crate::broker::maintenance::Maintenance;
use crate::broker::message::{DeliveryMode, Message, MessageType, Priority};
use crate::broker::middleware::{HandlerRegistry, MessageHandler, Middleware, MiddlewarePipeline};
use crate::broker::stats::{
    BrokerStatistics, FailureRecord, PerformanceAlert, PerformanceReport, StatsRecorder,
};
use crate::broker::topic::SubscriptionRegistry;
use crate::config::{BrokerSettings, MaintenanceSettings, Settings};
use crate::persistence::{DeadLetter, DeadLetterStore};
use crate::transport::channel::PushChannel;
use crate::transport::queue::{AgentQueue, EnqueueError};
use crate::transport::webhook::{HttpWebhookClient, WebhookClient};
use crate::utils::error::{DeliveryFailure, Result};

/// Sender id used for messages the broker emits itself.
pub const BROKER_AGENT_ID: &str = "message_broker";

type Delivery = std::result::Result<DateTime<Utc>, DeliveryFailure>;

pub struct MessageBroker {
    settings: BrokerSettings,
    maintenance_settings: MaintenanceSettings,
    endpoints: RwLock<HashMap<AgentId, AgentEndpoint>>,
    queues: RwLock<HashMap<AgentId, Arc<AgentQueue>>>,
    channels: RwLock<HashMap<AgentId, Arc<dyn PushChannel>>>,
    subscriptions: Mutex<SubscriptionRegistry>,
    middleware: RwLock<MiddlewarePipeline>,
    handlers: RwLock<HandlerRegistry>,
    stats: Mutex<StatsRecorder>,
    webhook: Arc<dyn WebhookClient>,
    dead_letters: Option<DeadLetterStore>,
    maintenance: Mutex<Option<Maintenance>>,
    shut_down: AtomicBool,
}

impl MessageBroker {
    /// Build a broker from validated settings.
    ///
    /// Opens the dead-letter store when persistence is enabled. Invalid
    /// settings are the only fatal error.
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let webhook = HttpWebhookClient::new(Duration::from_millis(
            settings.broker.webhook_timeout_ms,
        ))?;

        let dead_letters = if settings.persistence.enabled {
            Some(DeadLetterStore::open(
                &settings.persistence.path,
                settings.persistence.ttl_secs,
                settings.persistence.max_entries,
            )?)
        } else {
            None
        };

        Ok(Self {
            settings: settings.broker.clone(),
            maintenance_settings: settings.maintenance.clone(),
            endpoints: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            middleware: RwLock::new(MiddlewarePipeline::new()),
            handlers: RwLock::new(HandlerRegistry::new()),
            stats: Mutex::new(StatsRecorder::new(
                settings.broker.latency_sample_limit,
                settings.broker.failure_history_limit,
            )),
            webhook: Arc::new(webhook),
            dead_letters,
            maintenance: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Replace the HTTP client used by the webhook sink.
    pub fn with_webhook_client(mut self, client: Arc<dyn WebhookClient>) -> Self {
        self.webhook = client;
        self
    }

    /// Journal failed dispatches into `store`.
    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    /// Insert or replace an endpoint. Queue-backed endpoints get a bounded
    /// queue if they do not already have one.
    pub fn register_agent(&self, endpoint: AgentEndpoint) {
        let agent_id = endpoint.agent_id.clone();
        let transport = endpoint.transport;
        let capacity = match endpoint.max_concurrent_messages {
            0 => self.settings.default_queue_capacity,
            n => n,
        };

        self.endpoints.write().insert(agent_id.clone(), endpoint);

        let mut queues = self.queues.write();
        match transport {
            TransportKind::InternalQueue => {
                let fresh = queues.get(&agent_id).is_none_or(|q| q.is_closed());
                if fresh {
                    queues.insert(
                        agent_id.clone(),
                        Arc::new(AgentQueue::new(format!("queue:{agent_id}"), capacity)),
                    );
                }
            }
            TransportKind::PushChannel | TransportKind::Webhook => {
                if let Some(old) = queues.remove(&agent_id) {
                    old.close();
                }
            }
        }
        drop(queues);

        info!("Registered agent {agent_id} ({transport:?})");
    }

    /// Remove an endpoint, close its channel and drain its queue.
    pub async fn unregister_agent(&self, agent_id: &str) {
        let removed = self.endpoints.write().remove(agent_id);
        if removed.is_none() {
            return;
        }

        let channel = self.channels.write().remove(agent_id);
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Closing channel for {agent_id} failed: {e}");
            }
        }

        let queue = self.queues.write().remove(agent_id);
        if let Some(queue) = queue {
            let discarded = queue.close();
            if discarded > 0 {
                debug!("Discarded {discarded} queued messages for {agent_id}");
            }
        }

        self.subscriptions.lock().remove_agent(agent_id);
        info!("Unregistered agent {agent_id}");
    }

    /// Attach a live push channel. Marks the endpoint active.
    pub async fn connect_channel(&self, agent_id: &str, channel: Arc<dyn PushChannel>) {
        let previous = self.channels.write().insert(agent_id.to_string(), channel);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!("Closing replaced channel for {agent_id} failed: {e}");
            }
        }

        if let Some(endpoint) = self.endpoints.write().get_mut(agent_id) {
            endpoint.touch(Utc::now());
        }
        info!("Channel connected for {agent_id}");
    }

    /// Detach and close the live push channel, if any.
    pub async fn disconnect_channel(&self, agent_id: &str) {
        let channel = self.channels.write().remove(agent_id);
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Closing channel for {agent_id} failed: {e}");
            }
            info!("Channel disconnected for {agent_id}");
        }
    }

    /// Detach `channel` only if it is still the one registered for the agent.
    pub(crate) fn release_channel(&self, agent_id: &str, channel: &Arc<dyn PushChannel>) -> bool {
        let mut channels = self.channels.write();
        match channels.get(agent_id) {
            Some(current) if Arc::ptr_eq(current, channel) => {
                channels.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Refresh an agent's presence.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        match self.endpoints.write().get_mut(agent_id) {
            Some(endpoint) => {
                endpoint.touch(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, agent_id: &str, topic: &str) -> bool {
        let added = self.subscriptions.lock().subscribe(topic, agent_id);
        debug!("{agent_id} subscribed to {topic}");
        added
    }

    pub fn unsubscribe(&self, agent_id: &str, topic: &str) -> bool {
        let removed = self.subscriptions.lock().unsubscribe(topic, agent_id);
        debug!("{agent_id} unsubscribed from {topic}");
        removed
    }

    pub fn add_message_handler(
        &self,
        message_type: MessageType,
        handler: impl MessageHandler + 'static,
    ) {
        self.handlers.write().add(message_type, Arc::new(handler));
    }

    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.middleware.write().push(Arc::new(middleware));
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Dispatch a message. `true` iff it was delivered according to its mode.
    pub async fn send(&self, message: Message) -> bool {
        self.send_with_outcome(message).await.is_ok()
    }

    /// Like [`send`](Self::send), but reports why delivery failed.
    pub async fn send_with_outcome(
        &self,
        message: Message,
    ) -> std::result::Result<(), DeliveryFailure> {
        if self.is_shut_down() {
            self.record_failure(&message, DeliveryFailure::ShutDown);
            return Err(DeliveryFailure::ShutDown);
        }

        let pipeline = self.middleware.read().clone();
        let message_id = message.id.clone();
        let Some(message) = pipeline.run(message) else {
            self.stats.lock().record_dropped();
            debug!("Message {message_id} dropped by middleware");
            return Err(DeliveryFailure::Dropped);
        };

        if message.is_expired() {
            let record = FailureRecord::new(
                &message.id,
                message.recipient.as_deref(),
                &DeliveryFailure::Expired,
            );
            self.stats.lock().record_expired(record);
            self.journal(&message, &DeliveryFailure::Expired);
            debug!("Message {} expired before dispatch", message.id);
            return Err(DeliveryFailure::Expired);
        }

        let outcome = match message.delivery_mode {
            DeliveryMode::Broadcast => self.broadcast(&message).await,
            DeliveryMode::Multicast => self.multicast(&message).await,
            DeliveryMode::FireAndForget
            | DeliveryMode::Guaranteed
            | DeliveryMode::RequestResponse => match message.recipient.as_deref() {
                Some(recipient) => self.unicast(&message, recipient).await,
                None => Err(DeliveryFailure::NoRecipient),
            },
        };

        match outcome {
            Ok(delivered_at) => {
                let latency = delivered_at - message.created_at;
                let latency_ms = latency.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0;
                self.stats.lock().record_success(latency_ms);
                Ok(())
            }
            Err(failure) => {
                self.record_failure(&message, failure.clone());
                Err(failure)
            }
        }
    }

    async fn broadcast(&self, message: &Message) -> Delivery {
        let targets: Vec<(AgentId, Message)> = self
            .endpoints
            .read()
            .keys()
            .map(|id| (id.clone(), message.fan_out_copy(id)))
            .collect();
        let attempted = targets.len();

        let results = join_all(targets.iter().map(|(id, copy)| self.unicast(copy, id))).await;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();

        debug!("Broadcast {} reached {succeeded}/{attempted} agents", message.id);
        if succeeded as f64 > attempted as f64 * self.settings.broadcast_quorum {
            Ok(Utc::now())
        } else {
            Err(DeliveryFailure::BelowQuorum {
                succeeded,
                attempted,
            })
        }
    }

    async fn multicast(&self, message: &Message) -> Delivery {
        let subscribers = self.subscriptions.lock().subscribers(&message.routing_key);
        if subscribers.is_empty() {
            return Err(DeliveryFailure::NoSubscribers(message.routing_key.clone()));
        }
        let attempted = subscribers.len();

        let copies: Vec<Message> = subscribers
            .iter()
            .map(|id| message.fan_out_copy(id))
            .collect();
        let results = join_all(
            copies
                .iter()
                .zip(&subscribers)
                .map(|(copy, id)| self.unicast(copy, id)),
        )
        .await;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();

        debug!(
            "Multicast {} on {} reached {succeeded}/{attempted} subscribers",
            message.id, message.routing_key
        );
        if succeeded >= self.settings.multicast_min_successes {
            Ok(Utc::now())
        } else {
            Err(DeliveryFailure::BelowQuorum {
                succeeded,
                attempted,
            })
        }
    }

    async fn unicast(&self, message: &Message, recipient: &str) -> Delivery {
        let target = self
            .endpoints
            .read()
            .get(recipient)
            .map(|e| (e.transport, e.address.clone(), e.timeout));
        let Some((transport, address, timeout)) = target else {
            return Err(DeliveryFailure::UnknownRecipient(recipient.to_string()));
        };

        let delivered_at = Utc::now();
        let mut delivered = message.clone();
        delivered.delivered_at = Some(delivered_at);

        let handlers = self.handlers.read().handlers_for(delivered.message_type);
        let observed = (!handlers.is_empty()).then(|| delivered.clone());

        let result = match transport {
            TransportKind::InternalQueue => self.deliver_to_queue(recipient, delivered),
            TransportKind::PushChannel => self.deliver_to_channel(recipient, &delivered).await,
            TransportKind::Webhook => self.deliver_to_webhook(&address, timeout, &delivered).await,
        };

        // Broker-originated traffic (agent status) must not revive the agents it reports.
        let proves_presence =
            transport != TransportKind::InternalQueue && message.sender != BROKER_AGENT_ID;
        self.note_delivery(recipient, result.is_ok(), proves_presence);

        match result {
            Ok(()) => {
                debug!("Delivered {} to {recipient} via {transport:?}", message.id);
                if let Some(observed) = observed {
                    for handler in handlers {
                        handler.handle(&observed);
                    }
                }
                Ok(delivered_at)
            }
            Err(failure) => {
                debug!("Delivery of {} to {recipient} failed: {failure}", message.id);
                Err(failure)
            }
        }
    }

    fn deliver_to_queue(
        &self,
        recipient: &str,
        message: Message,
    ) -> std::result::Result<(), DeliveryFailure> {
        let queue = self.queues.read().get(recipient).cloned();
        let Some(queue) = queue else {
            return Err(DeliveryFailure::UnknownRecipient(recipient.to_string()));
        };
        match queue.try_enqueue(message) {
            Ok(()) => Ok(()),
            Err((EnqueueError::Full, _)) => Err(DeliveryFailure::QueueFull(recipient.to_string())),
            Err((EnqueueError::Closed, _)) => {
                Err(DeliveryFailure::UnknownRecipient(recipient.to_string()))
            }
        }
    }

    async fn deliver_to_channel(
        &self,
        recipient: &str,
        message: &Message,
    ) -> std::result::Result<(), DeliveryFailure> {
        let channel = self.channels.read().get(recipient).cloned();
        let Some(channel) = channel else {
            return Err(DeliveryFailure::ChannelUnavailable(recipient.to_string()));
        };

        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message {}: {e}", message.id);
                return Err(DeliveryFailure::ChannelUnavailable(recipient.to_string()));
            }
        };

        if let Err(e) = channel.send(frame).await {
            warn!("Push to {recipient} failed, dropping channel: {e}");
            self.release_channel(recipient, &channel);
            return Err(DeliveryFailure::ChannelUnavailable(recipient.to_string()));
        }
        Ok(())
    }

    async fn deliver_to_webhook(
        &self,
        url: &str,
        timeout: Duration,
        message: &Message,
    ) -> std::result::Result<(), DeliveryFailure> {
        let body =
            codec::encode(message).map_err(|e| DeliveryFailure::WebhookFailure(e.to_string()))?;
        self.webhook
            .post(url, body, timeout)
            .await
            .map_err(|e| DeliveryFailure::WebhookFailure(e.to_string()))
    }

    /// An enqueue says nothing about the agent itself; only a live sink
    /// accepting agent traffic refreshes presence.
    fn note_delivery(&self, agent_id: &str, ok: bool, proves_presence: bool) {
        let mut endpoints = self.endpoints.write();
        let Some(endpoint) = endpoints.get_mut(agent_id) else {
            return;
        };
        if ok {
            endpoint.message_count += 1;
            if proves_presence {
                endpoint.touch(Utc::now());
            }
        } else {
            endpoint.error_count += 1;
        }
    }

    fn record_failure(&self, message: &Message, failure: DeliveryFailure) {
        warn!("Message {} not delivered: {failure}", message.id);
        let record = FailureRecord::new(&message.id, message.recipient.as_deref(), &failure);
        self.stats.lock().record_failure(record);
        self.journal(message, &failure);
    }

    fn journal(&self, message: &Message, failure: &DeliveryFailure) {
        if let Some(store) = &self.dead_letters {
            if let Err(e) = store.record(message, failure) {
                error!("Failed to journal dead letter {}: {e}", message.id);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Consumption
    // ---------------------------------------------------------------------

    /// Wait up to `timeout` for the next message queued for `agent_id`.
    ///
    /// Returns `None` on timeout, for unknown agents and for agents that are
    /// not queue-backed. Messages that expired while queued are skipped.
    pub async fn receive(&self, agent_id: &str, timeout: Duration) -> Option<Message> {
        let queue = self.queues.read().get(agent_id).cloned()?;
        if let Some(endpoint) = self.endpoints.write().get_mut(agent_id) {
            endpoint.touch(Utc::now());
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = queue.dequeue(remaining).await?;
            if message.is_expired() {
                self.stats.lock().record_swept(1);
                debug!("Skipped expired message {} for {agent_id}", message.id);
                continue;
            }
            self.stats.lock().record_received();
            return Some(message);
        }
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn statistics(&self) -> BrokerStatistics {
        let mut snapshot = self.stats.lock().snapshot();
        snapshot.queue_depths = self
            .queues
            .read()
            .iter()
            .map(|(id, q)| (id.clone(), q.len()))
            .collect();
        let endpoints = self.endpoints.read();
        snapshot.total_agents = endpoints.len();
        snapshot.active_agents = endpoints.values().filter(|e| e.is_active).count();
        drop(endpoints);
        snapshot.subscription_topics = self.subscriptions.lock().topic_count();
        snapshot
    }

    pub fn endpoint(&self, agent_id: &str) -> Option<AgentEndpoint> {
        self.endpoints.read().get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.endpoints.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.subscriptions.lock().subscribers(topic)
    }

    pub fn has_channel(&self, agent_id: &str) -> bool {
        self.channels.read().contains_key(agent_id)
    }

    /// Journaled failures, oldest first. Empty when no store is configured.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        match &self.dead_letters {
            Some(store) => store.load(),
            None => Ok(Vec::new()),
        }
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Start the expiry, performance and heartbeat routines.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        // Checked under the slot lock: `shutdown` sets the flag before taking the slot.
        if self.is_shut_down() {
            return;
        }
        if slot.is_none() {
            *slot = Some(Maintenance::spawn(self, &self.maintenance_settings));
            info!("Broker maintenance started");
        }
    }

    /// Remove expired messages from every queue; returns how many.
    pub fn run_expiry_sweep(&self) -> usize {
        let queues: Vec<Arc<AgentQueue>> = self.queues.read().values().cloned().collect();
        let now = Utc::now();
        let removed: usize = queues.iter().map(|q| q.purge_expired(now)).sum();
        if removed > 0 {
            self.stats.lock().record_swept(removed);
            info!("Expiry sweep removed {removed} messages");
        }
        removed
    }

    /// Aggregate recent outcomes and raise an alert when a bound is crossed.
    pub fn run_performance_check(&self) -> PerformanceReport {
        let floor = self.maintenance_settings.success_rate_floor;
        let ceiling = self.maintenance_settings.latency_ceiling_ms;

        let mut stats = self.stats.lock();
        let report = stats.aggregate();

        let mut reasons = Vec::new();
        if report.samples > 0 && report.success_rate < floor {
            reasons.push(format!(
                "success rate {:.3} below {floor:.3}",
                report.success_rate
            ));
        }
        if report.average_latency_ms > ceiling {
            reasons.push(format!(
                "average latency {:.1}ms above {ceiling:.1}ms",
                report.average_latency_ms
            ));
        }
        if !reasons.is_empty() {
            let reason = reasons.join("; ");
            warn!("Broker performance degraded: {reason}");
            stats.push_alert(PerformanceAlert {
                timestamp: report.timestamp,
                success_rate: report.success_rate,
                average_latency_ms: report.average_latency_ms,
                reason,
            });
        }
        report
    }

    /// Flip endpoints that went quiet to inactive and announce them once.
    pub async fn run_heartbeat_check(&self) -> Vec<AgentId> {
        let window = chrono::Duration::milliseconds(
            i64::try_from(self.maintenance_settings.inactivity_window_ms).unwrap_or(i64::MAX),
        );
        let now = Utc::now();

        let mut inactive: Vec<AgentId> = self
            .endpoints
            .write()
            .values_mut()
            .filter(|e| e.is_active && now - e.last_seen > window)
            .map(|e| {
                e.is_active = false;
                e.agent_id.clone()
            })
            .collect();
        if inactive.is_empty() {
            return inactive;
        }
        inactive.sort();

        warn!("Agents became inactive: {}", inactive.join(", "));
        let status = agent_status_message(&inactive, now);
        if !self.send(status).await {
            debug!("Agent status broadcast did not reach a quorum");
        }
        inactive
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance.lock().is_some()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop maintenance, close every channel and queue. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.stop().await;
        }

        let channels: Vec<(AgentId, Arc<dyn PushChannel>)> =
            self.channels.write().drain().collect();
        for (agent_id, channel) in channels {
            if let Err(e) = channel.close().await {
                debug!("Closing channel for {agent_id} failed: {e}");
            }
        }

        for queue in self.queues.read().values() {
            queue.close();
        }

        info!("Broker shut down");
    }
}

fn agent_status_message(inactive: &[AgentId], checked_at: DateTime<Utc>) -> Message {
    let mut payload = Map::new();
    payload.insert("status".to_string(), Value::from("inactive"));
    payload.insert("inactive_agents".to_string(), json!(inactive));
    payload.insert("checked_at".to_string(), Value::from(checked_at.to_rfc3339()));

    Message::new(MessageType::AgentStatus, BROKER_AGENT_ID, payload)
        .with_mode(DeliveryMode::Broadcast)
        .with_priority(Priority::High)
}

impl std::fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBroker")
            .field("agents", &self.endpoints.read().len())
            .field("channels", &self.channels.read().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
