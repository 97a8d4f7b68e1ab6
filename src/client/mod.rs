//! The `client` module represents one agent connected through the
//! WebSocket gateway.
//!
//! A `Client` owns the sending half of a per-connection channel; the
//! gateway drains the other half into the socket. The broker sees it only
//! as a `PushChannel`.

pub mod pubsub_client;
pub use pubsub_client::Client;
