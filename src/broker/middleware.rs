//! Interception points
//!
//! - [`Middleware`] stages run in registration order on every message
//!   before dispatch. A stage returns the (possibly rewritten) message, or
//!   `None` to drop it.
//! - [`MessageHandler`]s observe delivered messages of one `MessageType`.
//!
//! Plain closures implement both traits.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::message::{Message, MessageType};

pub trait Middleware: Send + Sync {
    fn process(&self, message: Message) -> Option<Message>;
}

impl<F> Middleware for F
where
    F: Fn(Message) -> Option<Message> + Send + Sync,
{
    fn process(&self, message: Message) -> Option<Message> {
        self(message)
    }
}

pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order. Stops at the first stage that drops.
    pub fn run(&self, message: Message) -> Option<Message> {
        self.stages
            .iter()
            .try_fold(message, |msg, stage| stage.process(msg))
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(message_type).or_default().push(handler);
    }

    /// Handlers registered for `message_type`, in registration order.
    pub fn handlers_for(&self, message_type: MessageType) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.get(&message_type).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.len())
            .finish()
    }
}
