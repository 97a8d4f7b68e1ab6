//! Push-channel sink
//!
//! Any live, bidirectional connection to an agent implements
//! [`PushChannel`]. The broker hands it the serialized message; an error
//! means the channel is gone and the broker drops it.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::error::TransportError;

#[async_trait]
pub trait PushChannel: Send + Sync + Debug {
    /// Push one serialized message to the agent.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Close the channel. Errors are reported but the broker ignores them.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// In-process push channel backed by an unbounded `mpsc` sender.
///
/// Used by agents living in the same process that still want push
/// semantics instead of polling `receive`.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    sender: mpsc::UnboundedSender<String>,
}

impl LocalChannel {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl PushChannel for LocalChannel {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }
}
