use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use super::codec;
use super::endpoint::AgentEndpoint;
use super::engine::{BROKER_AGENT_ID, MessageBroker};
use super::message::{DeliveryMode, Message, MessageType, Priority};
use super::router::ContentRouter;
use super::topic::{SubscriptionRegistry, Topic};
use crate::config::Settings;
use crate::persistence::DeadLetterStore;
use crate::transport::channel::LocalChannel;
use crate::transport::webhook::WebhookClient;
use crate::utils::error::{BrokerError, DeliveryFailure, TransportError};

fn broker() -> MessageBroker {
    MessageBroker::new(&Settings::default()).unwrap()
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn task(sender: &str, recipient: &str, n: u64) -> Message {
    Message::new(MessageType::TaskAssignment, sender, payload(json!({ "n": n }))).to(recipient)
}

#[derive(Default)]
struct RecordingWebhook {
    posts: Mutex<Vec<(String, String)>>,
    status: Option<u16>,
}

#[async_trait]
impl WebhookClient for RecordingWebhook {
    async fn post(
        &self,
        url: &str,
        body: String,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if let Some(code) = self.status {
            return Err(TransportError::Status(code));
        }
        self.posts.lock().push((url.to_string(), body));
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Messages and codec
// -------------------------------------------------------------------------

#[test]
fn test_message_defaults() {
    let msg = Message::new(MessageType::TaskProgress, "tutor", Map::new());
    assert_eq!(msg.routing_key, "task_progress.tutor");
    assert_eq!(msg.priority, Priority::Normal);
    assert_eq!(msg.delivery_mode, DeliveryMode::FireAndForget);
    assert!(msg.recipient.is_none());
    assert!(msg.expires_at.is_none());
    assert!(!msg.is_expired());
}

#[test]
fn test_priority_ordering() {
    assert!(Priority::Low < Priority::Normal);
    assert!(Priority::Normal < Priority::High);
    assert!(Priority::High < Priority::Critical);
    assert!(Priority::Critical < Priority::Emergency);
}

#[test]
fn test_ttl_sets_expiry() {
    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new())
        .with_ttl(Duration::from_millis(1500));
    let expires_at = msg.expires_at.unwrap();
    assert_eq!((expires_at - msg.created_at).num_milliseconds(), 1500);
    assert!(!msg.is_expired_at(msg.created_at));
    assert!(msg.is_expired_at(expires_at + chrono::Duration::milliseconds(1)));
    // Exactly at the deadline is not yet expired.
    assert!(!msg.is_expired_at(expires_at));
}

#[test]
fn test_explicit_expiry_wins_over_ttl() {
    let at = Utc::now() + chrono::Duration::hours(1);
    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new())
        .with_expires_at(at)
        .with_ttl(Duration::from_secs(1));
    assert_eq!(msg.expires_at, Some(at));
}

#[test]
fn test_reply_follows_request() {
    let request = Message::new(MessageType::ReviewRequest, "a", Map::new())
        .to("reviewer")
        .with_priority(Priority::High)
        .expecting_reply("a-inbox");
    assert_eq!(request.delivery_mode, DeliveryMode::RequestResponse);
    assert_eq!(request.correlation_id.as_deref(), Some(request.id.as_str()));

    let reply = request.reply("reviewer", payload(json!({ "ok": true })));
    assert_eq!(reply.recipient.as_deref(), Some("a-inbox"));
    assert_eq!(reply.sender, "reviewer");
    assert_eq!(reply.priority, Priority::High);
    assert_eq!(reply.correlation_id, request.correlation_id);
    assert_ne!(reply.id, request.id);
}

#[test]
fn test_codec_round_trip() {
    let msg = Message::new(
        MessageType::QualityCheck,
        "checker",
        payload(json!({ "score": 0.9, "notes": ["ok"] })),
    )
    .to("lead")
    .with_priority(Priority::Critical)
    .with_ttl(Duration::from_secs(30))
    .with_tag("subject", "math")
    .with_metadata("trace", json!("abc"))
    .expecting_reply("checker");

    let wire = codec::encode(&msg).unwrap();
    let value: Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(value["schema_version"], json!(codec::SCHEMA_VERSION));
    assert_eq!(value["type"], json!("quality_check"));
    assert_eq!(value["priority"], json!("critical"));
    assert_eq!(value["ttl_ms"], json!(30_000));

    let decoded = codec::decode(&wire).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn test_codec_rejects_unknown_type() {
    let msg = Message::new(MessageType::Heartbeat, "a", Map::new());
    let mut value: Value = serde_json::from_str(&codec::encode(&msg).unwrap()).unwrap();
    value["type"] = json!("telepathy");
    let err = codec::decode(&value.to_string()).unwrap_err();
    assert!(matches!(err, BrokerError::Codec(_)));
}

#[test]
fn test_codec_rejects_unknown_schema_version() {
    let msg = Message::new(MessageType::Heartbeat, "a", Map::new());
    let mut value: Value = serde_json::from_str(&codec::encode(&msg).unwrap()).unwrap();
    value["schema_version"] = json!(2);
    let err = codec::decode(&value.to_string()).unwrap_err();
    assert!(matches!(err, BrokerError::UnsupportedSchema(2)));

    value.as_object_mut().unwrap().remove("schema_version");
    let err = codec::decode(&value.to_string()).unwrap_err();
    assert!(matches!(err, BrokerError::Codec(_)));
}

#[test]
fn test_decode_derives_expiry_from_ttl() {
    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new()).to("b");
    let mut value: Value = serde_json::from_str(&codec::encode(&msg).unwrap()).unwrap();
    value["created_at"] = json!("2000-01-01T00:00:00Z");
    value["ttl_ms"] = json!(1);
    value["expires_at"] = Value::Null;

    let decoded = codec::decode(&value.to_string()).unwrap();
    assert_eq!(decoded.ttl, Some(Duration::from_millis(1)));
    assert_eq!(
        decoded.expires_at.unwrap().to_rfc3339(),
        "2000-01-01T00:00:00.001+00:00"
    );
    assert!(decoded.is_expired());
}

#[test]
fn test_decode_keeps_explicit_expiry() {
    let at = Utc::now() + chrono::Duration::hours(2);
    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new())
        .with_expires_at(at)
        .with_ttl(Duration::from_millis(1));
    let decoded = codec::decode(&codec::encode(&msg).unwrap()).unwrap();
    assert_eq!(decoded.expires_at, Some(at));
}

#[test]
fn test_huge_ttl_saturates() {
    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new()).with_ttl(Duration::MAX);
    assert_eq!(msg.ttl, Some(Duration::from_millis(u64::MAX)));
    assert!(!msg.is_expired());

    let value: Value = serde_json::from_str(&codec::encode(&msg).unwrap()).unwrap();
    assert_eq!(value["ttl_ms"], json!(u64::MAX));
}

#[tokio::test]
async fn test_stale_wire_message_is_not_delivered() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));

    let msg = Message::new(MessageType::LiveUpdate, "a", Map::new()).to("b");
    let mut value: Value = serde_json::from_str(&codec::encode(&msg).unwrap()).unwrap();
    value["created_at"] = json!("2000-01-01T00:00:00Z");
    value["ttl_ms"] = json!(1);
    let stale = codec::decode(&value.to_string()).unwrap();

    assert_eq!(
        broker.send_with_outcome(stale).await,
        Err(DeliveryFailure::Expired)
    );
    assert_eq!(broker.statistics().messages_expired, 1);
    assert!(broker.receive("b", Duration::ZERO).await.is_none());
}

// -------------------------------------------------------------------------
// Subscriptions
// -------------------------------------------------------------------------

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("alerts");
    assert!(topic.subscribe("a".to_string()));
    assert!(!topic.subscribe("a".to_string()));
    assert!(topic.unsubscribe("a"));
    assert!(!topic.unsubscribe("a"));
    assert!(topic.is_empty());
}

#[test]
fn test_registry_drops_empty_topics() {
    let mut registry = SubscriptionRegistry::new();
    registry.subscribe("alerts", "a");
    registry.subscribe("alerts", "b");
    registry.subscribe("news", "a");
    assert_eq!(registry.subscribers("alerts"), vec!["a", "b"]);

    registry.remove_agent("a");
    assert!(!registry.contains_topic("news"));
    assert_eq!(registry.subscribers("alerts"), vec!["b"]);

    registry.unsubscribe("alerts", "b");
    assert_eq!(registry.topic_count(), 0);
}

// -------------------------------------------------------------------------
// Unicast
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_unicast_delivery_to_queue() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("a"));
    broker.register_agent(AgentEndpoint::queue("b"));

    let msg = task("a", "b", 1);
    assert!(broker.send(msg.clone()).await);

    let got = broker.receive("b", Duration::from_millis(100)).await.unwrap();
    assert_eq!(got.id, msg.id);
    assert_eq!(got.payload, msg.payload);
    assert!(got.delivered_at.is_some());
    assert!(msg.delivered_at.is_none());

    let stats = broker.statistics();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(broker.endpoint("b").unwrap().message_count, 1);
}

#[tokio::test]
async fn test_receive_waits_for_delivery() {
    let broker = Arc::new(broker());
    broker.register_agent(AgentEndpoint::queue("b"));

    let consumer = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.receive("b", Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.send(task("a", "b", 7)).await);

    let got = consumer.await.unwrap().unwrap();
    assert_eq!(got.payload["n"], json!(7));
}

#[tokio::test]
async fn test_receive_times_out_and_ignores_unknown_agents() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.register_agent(AgentEndpoint::push_channel("p"));

    assert!(broker.receive("b", Duration::ZERO).await.is_none());
    assert!(broker.receive("b", Duration::from_millis(20)).await.is_none());
    assert!(broker.receive("ghost", Duration::ZERO).await.is_none());
    assert!(broker.receive("p", Duration::ZERO).await.is_none());
}

#[tokio::test]
async fn test_expired_message_is_not_delivered() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));

    let msg = task("a", "b", 1).with_expires_at(Utc::now() - chrono::Duration::seconds(1));
    assert_eq!(
        broker.send_with_outcome(msg).await,
        Err(DeliveryFailure::Expired)
    );

    let stats = broker.statistics();
    assert_eq!(stats.messages_expired, 1);
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(stats.recent_failures[0].kind, "expired");
    assert!(broker.receive("b", Duration::ZERO).await.is_none());
}

#[tokio::test]
async fn test_receive_skips_messages_that_expired_in_queue() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));

    assert!(
        broker
            .send(task("a", "b", 1).with_ttl(Duration::from_millis(20)))
            .await
    );
    assert!(broker.send(task("a", "b", 2)).await);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let got = broker.receive("b", Duration::ZERO).await.unwrap();
    assert_eq!(got.payload["n"], json!(2));
    assert_eq!(broker.statistics().messages_expired, 1);
}

#[tokio::test]
async fn test_queue_overflow_preserves_order() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b").with_capacity(2));

    assert!(broker.send(task("a", "b", 1)).await);
    assert!(broker.send(task("a", "b", 2)).await);
    assert_eq!(
        broker.send_with_outcome(task("a", "b", 3)).await,
        Err(DeliveryFailure::QueueFull("b".to_string()))
    );

    let first = broker.receive("b", Duration::ZERO).await.unwrap();
    let second = broker.receive("b", Duration::ZERO).await.unwrap();
    assert_eq!(first.payload["n"], json!(1));
    assert_eq!(second.payload["n"], json!(2));
    assert!(broker.receive("b", Duration::ZERO).await.is_none());

    let stats = broker.statistics();
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.recent_failures[0].kind, "queue_full");
    assert_eq!(broker.endpoint("b").unwrap().error_count, 1);
}

#[tokio::test]
async fn test_unicast_failures() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("a"));

    let no_recipient = Message::new(MessageType::Coordination, "a", Map::new());
    assert_eq!(
        broker.send_with_outcome(no_recipient).await,
        Err(DeliveryFailure::NoRecipient)
    );
    assert_eq!(
        broker.send_with_outcome(task("a", "ghost", 1)).await,
        Err(DeliveryFailure::UnknownRecipient("ghost".to_string()))
    );

    let stats = broker.statistics();
    assert_eq!(stats.messages_failed, 2);
    assert_eq!(stats.recent_failure_count, 2);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn test_reregistration_keeps_queue() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));
    assert!(broker.send(task("a", "b", 1)).await);

    broker.register_agent(AgentEndpoint::queue("b").with_capability("subject:math"));
    assert_eq!(broker.endpoint("b").unwrap().capabilities, vec!["subject:math"]);
    assert!(broker.receive("b", Duration::ZERO).await.is_some());
}

#[tokio::test]
async fn test_unregister_discards_queue_and_subscriptions() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.subscribe("b", "alerts");
    assert!(broker.send(task("a", "b", 1)).await);

    broker.unregister_agent("b").await;
    assert!(broker.endpoint("b").is_none());
    assert!(broker.subscribers("alerts").is_empty());
    assert!(broker.receive("b", Duration::ZERO).await.is_none());
    assert_eq!(
        broker.send_with_outcome(task("a", "b", 2)).await,
        Err(DeliveryFailure::UnknownRecipient("b".to_string()))
    );
}

// -------------------------------------------------------------------------
// Push channels and webhooks
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_push_channel_delivery() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::push_channel("p"));
    let (channel, mut rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;

    let msg = task("a", "p", 3);
    assert!(broker.send(msg.clone()).await);

    let frame = rx.recv().await.unwrap();
    let got = codec::decode(&frame).unwrap();
    assert_eq!(got.id, msg.id);
    assert!(got.delivered_at.is_some());
}

#[tokio::test]
async fn test_dead_channel_is_released() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::push_channel("p"));

    assert_eq!(
        broker.send_with_outcome(task("a", "p", 1)).await,
        Err(DeliveryFailure::ChannelUnavailable("p".to_string()))
    );

    let (channel, rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;
    drop(rx);
    assert!(!broker.send(task("a", "p", 2)).await);
    assert!(!broker.has_channel("p"));

    let (channel, mut rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;
    assert!(broker.send(task("a", "p", 3)).await);
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn test_reconnect_replaces_channel() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::push_channel("p"));
    let (first, mut first_rx) = LocalChannel::pair();
    let (second, mut second_rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(first)).await;
    broker.connect_channel("p", Arc::new(second)).await;

    assert!(broker.send(task("a", "p", 1)).await);
    assert!(second_rx.recv().await.is_some());
    assert!(first_rx.try_recv().is_err());

    broker.disconnect_channel("p").await;
    assert!(!broker.has_channel("p"));
}

#[tokio::test]
async fn test_webhook_delivery() {
    let hook = Arc::new(RecordingWebhook::default());
    let broker = broker().with_webhook_client(hook.clone());
    broker.register_agent(AgentEndpoint::webhook("w", "http://agents.local/w"));

    let msg = task("a", "w", 5);
    assert!(broker.send(msg.clone()).await);

    let posts = hook.posts.lock();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "http://agents.local/w");
    let got = codec::decode(&posts[0].1).unwrap();
    assert_eq!(got.id, msg.id);
    assert!(got.delivered_at.is_some());
    drop(posts);

    let endpoint = broker.endpoint("w").unwrap();
    assert_eq!(endpoint.message_count, 1);
    assert!(endpoint.is_active);
}

#[tokio::test]
async fn test_webhook_failure_is_recorded() {
    let hook = Arc::new(RecordingWebhook {
        status: Some(503),
        ..Default::default()
    });
    let broker = broker().with_webhook_client(hook);
    broker.register_agent(AgentEndpoint::webhook("w", "http://agents.local/w"));

    let outcome = broker.send_with_outcome(task("a", "w", 1)).await;
    assert!(matches!(outcome, Err(DeliveryFailure::WebhookFailure(_))));
    assert_eq!(broker.endpoint("w").unwrap().error_count, 1);
    assert_eq!(broker.statistics().recent_failures[0].kind, "webhook_failure");
}

// -------------------------------------------------------------------------
// Broadcast and multicast
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_broadcast_quorum() {
    let broker = broker();
    for id in ["a", "b", "c"] {
        broker.register_agent(AgentEndpoint::push_channel(id));
    }
    let (a, mut a_rx) = LocalChannel::pair();
    let (b, _b_rx) = LocalChannel::pair();
    broker.connect_channel("a", Arc::new(a)).await;
    broker.connect_channel("b", Arc::new(b)).await;

    let announce = Message::new(MessageType::SystemAlert, "a", Map::new())
        .with_mode(DeliveryMode::Broadcast);
    // 2 of 3 reached
    assert!(broker.send(announce.clone()).await);

    let copy = codec::decode(&a_rx.recv().await.unwrap()).unwrap();
    assert_eq!(copy.recipient.as_deref(), Some("a"));
    assert_eq!(copy.delivery_mode, DeliveryMode::FireAndForget);
    assert_eq!(copy.message_type, MessageType::SystemAlert);

    broker.disconnect_channel("b").await;
    // 1 of 3 reached
    assert_eq!(
        broker.send_with_outcome(announce).await,
        Err(DeliveryFailure::BelowQuorum {
            succeeded: 1,
            attempted: 3
        })
    );
}

#[tokio::test]
async fn test_broadcast_half_is_not_a_quorum() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::push_channel("a"));
    broker.register_agent(AgentEndpoint::push_channel("b"));
    let (a, _a_rx) = LocalChannel::pair();
    broker.connect_channel("a", Arc::new(a)).await;

    let announce = Message::new(MessageType::Broadcast, "a", Map::new())
        .with_mode(DeliveryMode::Broadcast);
    assert!(!broker.send(announce).await);
}

#[tokio::test]
async fn test_multicast_to_topic_subscribers() {
    let broker = broker();
    for id in ["a", "b", "c"] {
        broker.register_agent(AgentEndpoint::queue(id));
    }
    broker.subscribe("a", "alerts");
    broker.subscribe("c", "alerts");

    let alert = Message::new(
        MessageType::SystemAlert,
        "b",
        payload(json!({ "level": "warn" })),
    )
    .with_mode(DeliveryMode::Multicast)
    .with_routing_key("alerts");
    assert!(broker.send(alert.clone()).await);

    let to_a = broker.receive("a", Duration::ZERO).await.unwrap();
    let to_c = broker.receive("c", Duration::ZERO).await.unwrap();
    assert_eq!(to_a.payload, alert.payload);
    assert_eq!(to_c.payload, alert.payload);
    assert_eq!(to_a.recipient.as_deref(), Some("a"));
    assert_ne!(to_a.id, to_c.id);
    assert!(broker.receive("b", Duration::ZERO).await.is_none());
}

#[tokio::test]
async fn test_multicast_follows_subscription_changes() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("x"));
    broker.register_agent(AgentEndpoint::queue("y"));
    broker.subscribe("x", "grades");
    broker.subscribe("y", "grades");

    let update = || {
        Message::new(MessageType::LiveUpdate, "ops", Map::new())
            .with_mode(DeliveryMode::Multicast)
            .with_routing_key("grades")
    };

    assert!(broker.unsubscribe("y", "grades"));
    assert!(broker.send(update()).await);
    assert!(broker.receive("x", Duration::ZERO).await.is_some());
    assert!(broker.receive("y", Duration::ZERO).await.is_none());

    assert!(broker.subscribe("y", "grades"));
    assert!(broker.send(update()).await);
    assert!(broker.receive("x", Duration::ZERO).await.is_some());
    assert!(broker.receive("y", Duration::ZERO).await.is_some());
}

#[tokio::test]
async fn test_multicast_without_subscribers_fails() {
    let broker = broker();
    let msg = Message::new(MessageType::LiveUpdate, "ops", Map::new())
        .with_mode(DeliveryMode::Multicast)
        .with_routing_key("nobody");
    assert_eq!(
        broker.send_with_outcome(msg).await,
        Err(DeliveryFailure::NoSubscribers("nobody".to_string()))
    );
}

#[tokio::test]
async fn test_multicast_uses_default_routing_key() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("x"));
    broker.subscribe("x", "task_completed.worker");

    let done = Message::new(MessageType::TaskCompleted, "worker", Map::new())
        .with_mode(DeliveryMode::Multicast);
    assert!(broker.send(done).await);
    assert!(broker.receive("x", Duration::ZERO).await.is_some());
}

// -------------------------------------------------------------------------
// Middleware and handlers
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_middleware_drops_and_rewrites() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.add_middleware(|msg: Message| {
        if msg.payload.contains_key("spam") {
            None
        } else {
            Some(msg)
        }
    });
    broker.add_middleware(|msg: Message| Some(msg.with_metadata("screened", json!(true))));

    let mut spam = task("a", "b", 1);
    spam.payload.insert("spam".to_string(), json!(true));
    assert_eq!(
        broker.send_with_outcome(spam).await,
        Err(DeliveryFailure::Dropped)
    );

    assert!(broker.send(task("a", "b", 2)).await);
    let got = broker.receive("b", Duration::ZERO).await.unwrap();
    assert_eq!(got.metadata["screened"], json!(true));

    let stats = broker.statistics();
    assert_eq!(stats.messages_dropped, 1);
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(stats.messages_sent, 1);
}

#[tokio::test]
async fn test_handlers_observe_delivered_messages_by_type() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    broker.add_message_handler(MessageType::TaskCompleted, move |msg: &Message| {
        assert!(msg.delivered_at.is_some());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let done = |recipient: &str| {
        Message::new(MessageType::TaskCompleted, "a", Map::new()).to(recipient)
    };
    assert!(broker.send(done("b")).await);
    assert!(broker.send(task("a", "b", 1)).await);
    assert!(!broker.send(done("ghost")).await);

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

// -------------------------------------------------------------------------
// Maintenance
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_expiry_sweep_purges_queues() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));
    assert!(
        broker
            .send(task("a", "b", 1).with_ttl(Duration::from_millis(10)))
            .await
    );
    assert!(broker.send(task("a", "b", 2)).await);
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(broker.run_expiry_sweep(), 1);
    let stats = broker.statistics();
    assert_eq!(stats.queue_depths["b"], 1);
    assert_eq!(stats.messages_expired, 1);
}

#[tokio::test]
async fn test_performance_check_raises_alert() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("b"));

    let report = broker.run_performance_check();
    assert_eq!(report.samples, 0);
    assert!(broker.statistics().performance_alerts.is_empty());

    assert!(broker.send(task("a", "b", 1)).await);
    assert!(!broker.send(task("a", "ghost", 2)).await);

    let report = broker.run_performance_check();
    assert_eq!(report.samples, 2);
    assert_eq!(report.success_rate, 0.5);

    let stats = broker.statistics();
    assert_eq!(stats.performance_alerts.len(), 1);
    assert!(stats.performance_alerts[0].reason.contains("success rate"));
    assert_eq!(stats.last_performance.unwrap().samples, 2);
}

#[tokio::test]
async fn test_heartbeat_marks_quiet_agents_once() {
    let broker = broker();
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    broker.register_agent(AgentEndpoint::queue("a").with_last_seen(long_ago));
    broker.register_agent(AgentEndpoint::queue("b"));

    let inactive = broker.run_heartbeat_check().await;
    assert_eq!(inactive, vec!["a".to_string()]);
    assert!(!broker.endpoint("a").unwrap().is_active);
    assert!(broker.endpoint("b").unwrap().is_active);

    let status = broker.receive("b", Duration::ZERO).await.unwrap();
    assert_eq!(status.message_type, MessageType::AgentStatus);
    assert_eq!(status.sender, BROKER_AGENT_ID);
    assert_eq!(status.priority, Priority::High);
    assert_eq!(status.payload["status"], json!("inactive"));
    assert_eq!(status.payload["inactive_agents"], json!(["a"]));

    assert!(broker.run_heartbeat_check().await.is_empty());
    assert!(broker.receive("b", Duration::ZERO).await.is_none());
    assert_eq!(broker.statistics().active_agents, 1);
}

#[tokio::test]
async fn test_status_broadcast_does_not_revive_push_agent() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::push_channel("p"));
    let (channel, mut rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;
    // Re-register with a stale last_seen; the live channel stays attached.
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    broker.register_agent(AgentEndpoint::push_channel("p").with_last_seen(long_ago));

    assert_eq!(broker.run_heartbeat_check().await, vec!["p".to_string()]);

    let status = codec::decode(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(status.message_type, MessageType::AgentStatus);
    assert_eq!(status.payload["inactive_agents"], json!(["p"]));

    let endpoint = broker.endpoint("p").unwrap();
    assert!(!endpoint.is_active);
    assert_eq!(endpoint.last_seen, long_ago);
    assert_eq!(endpoint.message_count, 1);
    assert_eq!(broker.statistics().active_agents, 0);
    assert!(broker.run_heartbeat_check().await.is_empty());
}

#[tokio::test]
async fn test_agent_traffic_refreshes_push_agent() {
    let broker = broker();
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    broker.register_agent(AgentEndpoint::push_channel("p"));
    let (channel, _rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;
    broker.register_agent(AgentEndpoint::push_channel("p").with_last_seen(long_ago));

    assert!(broker.send(task("a", "p", 1)).await);
    assert!(broker.endpoint("p").unwrap().last_seen > long_ago);
    assert!(broker.run_heartbeat_check().await.is_empty());
}

#[tokio::test]
async fn test_heartbeat_reactivates_agent() {
    let broker = broker();
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    broker.register_agent(AgentEndpoint::queue("a").with_last_seen(long_ago));
    broker.run_heartbeat_check().await;
    assert!(!broker.endpoint("a").unwrap().is_active);

    assert!(broker.heartbeat("a"));
    assert!(!broker.heartbeat("ghost"));
    assert!(broker.endpoint("a").unwrap().is_active);
}

#[tokio::test]
async fn test_maintenance_runs_in_background() {
    let mut settings = Settings::default();
    settings.maintenance.expiry_sweep_interval_ms = 20;
    let broker = Arc::new(MessageBroker::new(&settings).unwrap());
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.start_maintenance();
    broker.start_maintenance();

    assert!(
        broker
            .send(task("a", "b", 1).with_ttl(Duration::from_millis(10)))
            .await
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stats = broker.statistics();
    assert_eq!(stats.queue_depths["b"], 0);
    assert_eq!(stats.messages_expired, 1);

    broker.shutdown().await;
}

// -------------------------------------------------------------------------
// Lifecycle, statistics and dead letters
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let broker = Arc::new(broker());
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.register_agent(AgentEndpoint::push_channel("p"));
    let (channel, _rx) = LocalChannel::pair();
    broker.connect_channel("p", Arc::new(channel)).await;
    broker.start_maintenance();

    broker.shutdown().await;
    broker.shutdown().await;
    assert!(broker.is_shut_down());
    assert!(!broker.has_channel("p"));
    assert_eq!(
        broker.send_with_outcome(task("a", "b", 1)).await,
        Err(DeliveryFailure::ShutDown)
    );
    assert!(broker.receive("b", Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_maintenance_not_started_after_shutdown() {
    let broker = Arc::new(broker());
    broker.start_maintenance();
    assert!(broker.is_maintenance_running());

    broker.shutdown().await;
    assert!(!broker.is_maintenance_running());

    broker.start_maintenance();
    assert!(!broker.is_maintenance_running());
}

#[tokio::test]
async fn test_statistics_snapshot() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("a"));
    broker.register_agent(AgentEndpoint::queue("b"));
    broker.register_agent(AgentEndpoint::push_channel("p"));
    broker.subscribe("a", "alerts");
    broker.subscribe("b", "news");
    assert!(broker.send(task("a", "b", 1)).await);
    assert!(broker.send(task("a", "b", 2)).await);

    let stats = broker.statistics();
    assert_eq!(stats.total_agents, 3);
    assert_eq!(stats.active_agents, 3);
    assert_eq!(stats.subscription_topics, 2);
    assert_eq!(stats.queue_depths["a"], 0);
    assert_eq!(stats.queue_depths["b"], 2);
    assert!(!stats.queue_depths.contains_key("p"));
    assert_eq!(stats.success_rate, 1.0);
    assert!(stats.average_latency_ms >= 0.0);
    assert_eq!(broker.agent_ids(), vec!["a", "b", "p"]);
}

#[tokio::test]
async fn test_failures_are_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let store = DeadLetterStore::open(dir.path().to_str().unwrap(), None, None).unwrap();
    let broker = broker().with_dead_letters(store);
    broker.register_agent(AgentEndpoint::queue("b"));

    let lost = task("a", "ghost", 1);
    assert!(!broker.send(lost.clone()).await);
    assert!(broker.send(task("a", "b", 2)).await);

    let letters = broker.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, lost.id);
    assert_eq!(letters[0].kind, "unknown_recipient");
    assert_eq!(letters[0].message().unwrap(), lost);
}

#[tokio::test]
async fn test_dead_letters_empty_without_store() {
    let broker = broker();
    assert!(!broker.send(task("a", "ghost", 1)).await);
    assert!(broker.dead_letters().unwrap().is_empty());
}

// -------------------------------------------------------------------------
// Content routing
// -------------------------------------------------------------------------

#[test]
fn test_router_resolves_by_tags() {
    let router = ContentRouter::new();
    router.register_specialist("math-tutor", "Subject", "Math");
    router.register_specialist("grader", "level", "advanced");
    router.register_specialist("author", "subject", "math");

    let msg = Message::new(MessageType::ContentSync, "author", Map::new())
        .with_tag("subject", " MATH ")
        .with_tag("level", "advanced")
        .with_tag("format", "video");

    let recipients: Vec<_> = router.resolve_recipients(&msg).into_iter().collect();
    assert_eq!(recipients, vec!["grader", "math-tutor"]);

    router.unregister_specialist("grader");
    let recipients: Vec<_> = router.resolve_recipients(&msg).into_iter().collect();
    assert_eq!(recipients, vec!["math-tutor"]);
}

#[test]
fn test_router_indexes_endpoint_capabilities() {
    let router = ContentRouter::new();
    let endpoint = AgentEndpoint::queue("reviewer")
        .with_capability("subject:science")
        .with_capability("review")
        .with_capability("level:");
    assert_eq!(router.index_endpoint(&endpoint), 1);

    let msg = Message::new(MessageType::ReviewRequest, "a", Map::new())
        .with_tag("subject", "science");
    assert!(router.resolve_recipients(&msg).contains("reviewer"));
}

#[tokio::test]
async fn test_router_dispatch_sends_copies() {
    let broker = broker();
    broker.register_agent(AgentEndpoint::queue("math-tutor"));
    let router = ContentRouter::new();
    router.register_specialist("math-tutor", "subject", "math");
    router.register_specialist("offline", "subject", "math");

    let msg = Message::new(
        MessageType::ContentSync,
        "author",
        payload(json!({ "unit": 3 })),
    )
    .with_tag("subject", "math");
    let summary = router.dispatch(&broker, &msg).await;
    assert_eq!(summary.delivered, vec!["math-tutor"]);
    assert_eq!(summary.failed, vec!["offline"]);

    let got = broker.receive("math-tutor", Duration::ZERO).await.unwrap();
    assert_eq!(got.payload, msg.payload);
    assert_eq!(got.recipient.as_deref(), Some("math-tutor"));
}
