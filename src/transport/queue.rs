//! Internal queue sink
//!
//! A bounded FIFO per agent. Enqueue never waits: a full queue rejects the
//! message and hands it back. Dequeue waits up to a timeout. Each queue
//! has its own lock so a congested agent never stalls delivery to another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

#[derive(Debug)]
pub struct AgentQueue {
    name: String,
    capacity: usize,
    buf: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl AgentQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append without waiting. Fails when at capacity or closed.
    pub fn try_enqueue(&self, message: Message) -> Result<(), (EnqueueError, Message)> {
        if self.is_closed() {
            return Err((EnqueueError::Closed, message));
        }
        {
            let mut buf = self.buf.lock();
            if buf.len() >= self.capacity {
                return Err((EnqueueError::Full, message));
            }
            buf.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<Message> {
        self.buf.lock().pop_front()
    }

    /// Wait up to `timeout` for the next message. `None` on timeout or close.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.notify.notified();
            if let Some(msg) = self.try_dequeue() {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    /// Remove every message that expired by `now`; returns how many.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut buf = self.buf.lock();
        let before = buf.len();
        buf.retain(|m| !m.is_expired_at(now));
        before - buf.len()
    }

    /// Close the queue, wake all waiters and discard what was queued.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let drained = {
            let mut buf = self.buf.lock();
            let n = buf.len();
            buf.clear();
            n
        };
        self.notify.notify_waiters();
        drained
    }
}
