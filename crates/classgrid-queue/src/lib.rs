//! classgrid-queue: the task and result queues.
//!
//! Wraps a message broker behind the [`Queue`] trait:
//!
//! - `send` publishes a body plus string attributes
//! - `receive` claims up to N messages, long-polling up to a wait
//! - `ack` deletes a claimed message by its receipt handle
//! - `approximate_depth` counts visible, unclaimed messages
//!
//! Delivery is at-least-once. A claimed message that is not acknowledged
//! within the broker's visibility timeout becomes visible again and is
//! redelivered with an incremented `receive_count`.
//!
//! Two brokers are provided: [`MemoryBroker`] for single-process setups and
//! tests, and [`RedisBroker`] for deployments where gateway and workers run
//! in different processes.

pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classgrid_core::Attributes;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use retry::{RetryPolicy, with_backoff};

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message claimed from a queue.
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned message id (stable across redeliveries).
    pub id: String,
    pub body: String,
    pub attributes: Attributes,
    /// Handle for acknowledging this delivery.
    pub handle: ReceiptHandle,
    /// Number of times the message has been delivered, including this one.
    pub receive_count: u32,
}

/// Broker operations the gateway, workers, and autoscaler rely on.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish a message. Returns the broker-assigned message id.
    async fn send(&self, queue: &str, body: &str, attributes: &Attributes) -> QueueResult<String>;

    /// Claim up to `max_messages`, waiting up to `wait` for the first one.
    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> QueueResult<Vec<Message>>;

    /// Delete a claimed message.
    async fn ack(&self, queue: &str, handle: &ReceiptHandle) -> QueueResult<()>;

    /// Visible messages waiting to be claimed.
    async fn approximate_depth(&self, queue: &str) -> QueueResult<usize>;
}

/// Shared handle to a broker.
pub type SharedQueue = Arc<dyn Queue>;
