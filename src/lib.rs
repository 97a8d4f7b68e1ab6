//! # agentbus
//!
//! `agentbus` is an in-process message broker for cooperating agents. It
//! routes typed messages between registered agents over one of three
//! sinks (a bounded internal queue, a live push channel or an HTTP
//! webhook) with unicast, broadcast, topic multicast and request-response
//! semantics, message expiry, liveness tracking and delivery statistics.
//!
//! ## Core Modules
//!
//! - `broker`: messages, the wire codec, endpoints, subscriptions, the
//!   middleware pipeline, statistics, background maintenance, the
//!   content-aware router and the `MessageBroker` itself.
//! - `client`: one agent connected through the WebSocket gateway.
//! - `config`: layered settings (file, environment, defaults).
//! - `persistence`: sled-backed journal of failed dispatches.
//! - `transport`: the queue, push-channel and webhook sinks plus the
//!   WebSocket gateway.
//! - `utils`: error types and logging initialization.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::{
    AgentEndpoint, AgentId, BrokerStatistics, ContentRouter, DeliveryMode, Message,
    MessageBroker, MessageType, Priority, RouteSummary, TransportKind,
};
pub use config::Settings;
pub use utils::error::{BrokerError, DeliveryFailure, Result};
