//! The `error` module defines the error types used within `agentbus`.
//!
//! Two families live here:
//!
//! - [`DeliveryFailure`]: the outcome of a dispatch that did not reach its
//!   recipient(s). These are never fatal. `MessageBroker::send` folds them
//!   into a `false` result and records the reason in the failure history.
//! - [`BrokerError`] and [`TransportError`]: construction, codec, storage
//!   and sink-level errors propagated with `?`.

use thiserror::Error;

/// Result type alias for fallible broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Why a message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("dropped by middleware")]
    Dropped,

    #[error("message expired before dispatch")]
    Expired,

    #[error("no recipient set for unicast delivery")]
    NoRecipient,

    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("no subscribers for topic: {0}")]
    NoSubscribers(String),

    #[error("queue full for agent: {0}")]
    QueueFull(String),

    #[error("no live channel for agent: {0}")]
    ChannelUnavailable(String),

    #[error("webhook delivery failed: {0}")]
    WebhookFailure(String),

    #[error("only {succeeded} of {attempted} deliveries succeeded")]
    BelowQuorum { succeeded: usize, attempted: usize },

    #[error("broker is shut down")]
    ShutDown,
}

impl DeliveryFailure {
    /// Short machine-readable tag, used in failure records and dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::Expired => "expired",
            Self::NoRecipient => "no_recipient",
            Self::UnknownRecipient(_) => "unknown_recipient",
            Self::NoSubscribers(_) => "no_subscribers",
            Self::QueueFull(_) => "queue_full",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::WebhookFailure(_) => "webhook_failure",
            Self::BelowQuorum { .. } => "below_quorum",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Errors raised by a transport sink while attempting delivery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status: {0}")]
    Status(u16),
}

/// Fatal and propagated errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(u32),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Codec(err.to_string())
    }
}

impl From<sled::Error> for BrokerError {
    fn from(err: sled::Error) -> Self {
        BrokerError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::Config(err.to_string())
    }
}
