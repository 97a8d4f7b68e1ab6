use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;

use crate::transport::channel::PushChannel;
use crate::utils::error::TransportError;

/// A connected WebSocket agent.
#[derive(Debug, Clone)]
pub struct Client {
    /// Agent id announced in the `register` frame.
    pub id: String,

    /// Channel to send WebSocket frames to the agent.
    pub sender: UnboundedSender<WsMessage>,
}

impl Client {
    pub fn new(id: impl Into<String>, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            sender,
        }
    }
}

#[async_trait]
impl PushChannel for Client {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender
            .send(WsMessage::text(frame))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sender
            .send(WsMessage::Close(None))
            .map_err(|_| TransportError::ChannelClosed)
    }
}
