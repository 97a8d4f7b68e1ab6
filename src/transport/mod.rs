//! The `transport` module holds the delivery sinks and the network gateway.
//!
//! - `queue`: bounded per-agent FIFO for in-process consumers
//! - `channel`: the `PushChannel` seam for live connections
//! - `webhook`: HTTP POST delivery
//! - `message` / `websocket`: the WebSocket gateway through which remote
//!   agents register, subscribe, send and receive pushes

pub mod channel;
pub mod message;
pub mod queue;
pub mod webhook;
pub mod websocket;
