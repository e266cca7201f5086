//! Job queue with at-least-once delivery.
//!
//! A received message becomes invisible for the visibility timeout. If it
//! is not deleted in that window it is delivered again under a new receipt
//! handle, and the old receipt stops working.

use async_trait::async_trait;
use drishti_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle for [`JobQueue::delete`]; valid until the message is redelivered
    pub receipt: String,
    pub body: String,
    /// 1 on first delivery
    pub receive_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a message body, returning its id
    async fn send(&self, body: String) -> Result<String>;

    /// Long-poll for at most one message, waiting up to `wait`
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>>;

    /// Acknowledge a message. Returns `false` if the receipt is stale.
    async fn delete(&self, receipt: &str) -> Result<bool>;
}

struct Entry {
    id: String,
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

/// In-process queue with visibility timeouts and receipt handles
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    entries: Mutex<VecDeque<Entry>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Messages not yet deleted, in flight or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by an unexpired receive
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().iter().filter(|e| !e.is_visible(now)).count()
    }

    fn try_receive(&self) -> (Option<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.iter_mut().find(|e| e.is_visible(now)) {
            let receipt = uuid::Uuid::new_v4().to_string();
            entry.receive_count += 1;
            entry.receipt = Some(receipt.clone());
            entry.invisible_until = Some(now + self.visibility_timeout);
            return (
                Some(ReceivedMessage {
                    message_id: entry.id.clone(),
                    receipt,
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                }),
                None,
            );
        }

        let next_visible = entries.iter().filter_map(|e| e.invisible_until).min();
        (None, next_visible)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.lock().push_back(Entry {
            id: id.clone(),
            body,
            receive_count: 0,
            receipt: None,
            invisible_until: None,
        });
        self.notify.notify_one();
        debug!("Queued message {} on {}", id, self.name);
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let (message, next_visible) = self.try_receive();
            if message.is_some() {
                return Ok(message);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout(wake_at.saturating_duration_since(now), notified).await;
        }
    }

    async fn delete(&self, receipt: &str) -> Result<bool> {
        if receipt.is_empty() {
            return Err(Error::Queue("Empty receipt handle".to_string()));
        }
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt));
        Ok(match position {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        })
    }
}
