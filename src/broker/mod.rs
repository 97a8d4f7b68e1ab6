pub mod codec;
pub mod endpoint;
pub mod engine;
pub mod maintenance;
pub mod message;
pub mod middleware;
pub mod router;
pub mod stats;
pub mod topic;

pub use endpoint::{AgentEndpoint, AgentId, TransportKind};
pub use engine::{BROKER_AGENT_ID, MessageBroker};
pub use message::{DeliveryMode, Message, MessageType, Priority};
pub use router::{ContentRouter, RouteSummary};
pub use stats::BrokerStatistics;

#[cfg(test)]
mod tests;
