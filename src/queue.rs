//! Message-queue abstraction between the command path and the worker.
//!
//! One message per appended event, body `JSON(RecordedEvent)`. Delivery
//! is at-least-once: a message stays invisible while in flight and only
//! disappears when the consumer deletes its receipt after a successful
//! projection. [`InMemoryQueue`] models that lifecycle (including
//! redelivery) for tests and single-process runs; [`DisabledQueue`] is
//! the no-op used when no queue is configured.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// Failures surfaced by a queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
}

/// One received message plus the handle that acknowledges it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque per-delivery handle; pass to [`MessageQueue::delete`].
    pub receipt_handle: String,
    pub body: String,
}

/// Queue contract consumed by the publisher and the projection worker.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, body: String) -> Result<(), QueueError>;

    /// Receive up to `max_messages`, long-polling up to `wait`.
    ///
    /// Returns an empty batch when the wait elapses with nothing queued.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge one delivery. Unknown handles are ignored: the message
    /// may already have been redelivered and deleted elsewhere.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: VecDeque<String>,
    in_flight: HashMap<String, String>,
}

/// In-memory [`MessageQueue`] with receipt handles and redelivery.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
}

/// Poll granularity for the long-poll loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>, QueueError> {
        self.inner
            .lock()
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    /// Messages waiting to be received (excludes in-flight).
    pub fn depth(&self) -> usize {
        self.inner.lock().map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries received but not yet deleted.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().map(|q| q.in_flight.len()).unwrap_or(0)
    }

    /// Return every in-flight message to the ready queue, as a visibility
    /// timeout expiry would. Test hook for exercising at-least-once paths.
    pub fn redeliver(&self) {
        if let Ok(mut queue) = self.inner.lock() {
            let bodies: Vec<String> = queue.in_flight.drain().map(|(_, body)| body).collect();
            for body in bodies {
                queue.ready.push_back(body);
            }
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, body: String) -> Result<(), QueueError> {
        self.locked()?.ready.push_back(body);
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut queue = self.locked()?;
                if !queue.ready.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < max_messages.max(1) {
                        let Some(body) = queue.ready.pop_front() else {
                            break;
                        };
                        let receipt = Uuid::new_v4().to_string();
                        queue.in_flight.insert(receipt.clone(), body.clone());
                        batch.push(QueueMessage {
                            receipt_handle: receipt,
                            body,
                        });
                    }
                    return Ok(batch);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.locked()?.in_flight.remove(receipt_handle);
        Ok(())
    }
}

/// No-op queue used when publishing is disabled (no queue URL configured;
/// tests and single-process modes).
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledQueue;

#[async_trait]
impl MessageQueue for DisabledQueue {
    async fn send(&self, _body: String) -> Result<(), QueueError> {
        Ok(())
    }

    async fn receive(
        &self,
        _max_messages: usize,
        _wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _receipt_handle: &str) -> Result<(), QueueError> {
        Ok(())
    }
}
