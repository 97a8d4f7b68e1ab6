//! WebSocket gateway
//!
//! Lets remote agents attach to the broker over WebSocket:
//! - Accept TCP/WebSocket connections
//! - Require a `register` frame first; the agent is then registered as a
//!   push-channel endpoint and its `Client` becomes the live channel
//! - Translate `subscribe` / `unsubscribe` / `heartbeat` / `send` frames
//!   into broker operations and answer each with a control frame
//! - On disconnect, release the channel; the endpoint stays registered and
//!   is left to the liveness sweep

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::codec;
use crate::broker::endpoint::AgentEndpoint;
use crate::broker::engine::MessageBroker;
use crate::client::Client;
use crate::transport::channel::PushChannel;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::Result;

/// Bind `addr` and serve the gateway until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: Arc<MessageBroker>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, broker).await
}

/// Serve the gateway on an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<MessageBroker>) -> Result<()> {
    info!("WebSocket gateway listening on ws://{}", listener.local_addr()?);

    let mut failures: u32 = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => {
                failures = 0;
                conn
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = accept_backoff(failures);
                warn!("Accept failed: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        let broker = broker.clone();
        tokio::spawn(async move {
            debug!("Connection from {peer}");
            handle_connection(stream, broker).await;
        });
    }
}

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay after the `failures`-th consecutive accept error: doubles from
/// 50ms, capped at 1s.
pub(crate) fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1u32 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

struct Session {
    agent_id: String,
    channel: Arc<dyn PushChannel>,
}

async fn handle_connection(stream: TcpStream, broker: Arc<MessageBroker>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = msg.is_close();
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Send loop ended: {e}");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut session: Option<Session> = None;

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Read error: {e}");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let WsMessage::Text(text) = frame else {
            continue;
        };

        let parsed = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    "Invalid frame: {err} | {}",
                    text.as_str().chars().take(100).collect::<String>()
                );
                reply_error(&tx, &format!("invalid frame: {err}"));
                continue;
            }
        };

        let registered = session.as_ref().map(|s| s.agent_id.clone());
        match (parsed, registered) {
            (ClientMessage::Register { agent_id, capabilities }, None) => {
                let mut endpoint = AgentEndpoint::push_channel(&agent_id);
                endpoint.capabilities = capabilities;
                broker.register_agent(endpoint);

                let channel: Arc<dyn PushChannel> = Arc::new(Client::new(&agent_id, tx.clone()));
                broker.connect_channel(&agent_id, channel.clone()).await;
                reply(&tx, &ServerMessage::Registered {
                    agent_id: agent_id.clone(),
                });
                session = Some(Session { agent_id, channel });
            }
            (_, None) => {
                warn!("Frame before register; closing connection");
                reply_error(&tx, "must register first");
                break;
            }
            (msg, Some(agent_id)) => handle_frame(&broker, &tx, &agent_id, msg).await,
        }
    }

    if let Some(Session { agent_id, channel }) = session {
        if broker.release_channel(&agent_id, &channel) {
            info!("Agent {agent_id} disconnected");
        }
    }
}

async fn handle_frame(
    broker: &MessageBroker,
    tx: &UnboundedSender<WsMessage>,
    agent_id: &str,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Subscribe { topic } => {
            broker.subscribe(agent_id, &topic);
            reply(tx, &ServerMessage::Subscribed { topic });
        }
        ClientMessage::Unsubscribe { topic } => {
            broker.unsubscribe(agent_id, &topic);
            reply(tx, &ServerMessage::Unsubscribed { topic });
        }
        ClientMessage::Heartbeat => {
            broker.heartbeat(agent_id);
            reply(tx, &ServerMessage::Alive);
        }
        ClientMessage::Send { message } => {
            let message = match codec::decode(&message.to_string()) {
                Ok(message) => message,
                Err(e) => {
                    reply_error(tx, &format!("invalid message: {e}"));
                    return;
                }
            };
            if message.sender != agent_id {
                reply_error(tx, "sender does not match registered agent");
                return;
            }
            let message_id = message.id.clone();
            let outcome = broker.send_with_outcome(message).await;
            reply(tx, &ServerMessage::Ack {
                message_id,
                delivered: outcome.is_ok(),
                reason: outcome.err().map(|e| e.to_string()),
            });
        }
        ClientMessage::Register { .. } => reply_error(tx, "already registered"),
    }
}

fn reply(tx: &UnboundedSender<WsMessage>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(WsMessage::text(json));
        }
        Err(e) => error!("Failed to serialize control frame: {e}"),
    }
}

fn reply_error(tx: &UnboundedSender<WsMessage>, message: &str) {
    reply(tx, &ServerMessage::Error {
        message: message.to_string(),
    });
}
