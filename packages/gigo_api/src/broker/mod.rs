//! Message broker adapter.
//!
//! The websocket core only needs explicit-ack pull subscriptions with a
//! bounded wait, a subject purge, and (for operators and tests) a publish.
//! [`memory::MemoryBroker`] serves development and tests; the JetStream
//! adapter lives behind the `nats` feature.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The bounded wait elapsed without a delivery. Not a failure.
    #[error("timed out waiting for a delivery")]
    Timeout,
    /// The subscription was released or invalidated by the broker.
    #[error("subscription is closed")]
    SubscriptionClosed,
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("failed to purge {subject}: {reason}")]
    Purge { subject: String, reason: String },
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),
    #[error("broker error: {0}")]
    Backend(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> BrokerResult<()>;
}

/// One record pulled from a subscription, not yet acknowledged.
pub struct Delivery {
    pub payload: Bytes,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: impl Acker + 'static) -> Self {
        Self {
            payload,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// An explicit-ack pull subscription on a single subject.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn subject(&self) -> &str;

    /// Wait up to `timeout` for the next delivery.
    ///
    /// Returns [`BrokerError::Timeout`] when nothing arrived and
    /// [`BrokerError::SubscriptionClosed`] once the subscription is gone.
    async fn next(&mut self, timeout: Duration) -> BrokerResult<Delivery>;

    /// Release broker-side resources. Idempotent; unacknowledged deliveries
    /// become eligible for redelivery.
    async fn release(&mut self);
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, subject: &str) -> BrokerResult<Box<dyn Subscription>>;

    /// Discard every pending record on `subject`.
    async fn purge(&self, subject: &str) -> BrokerResult<()>;

    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()>;

    async fn health_check(&self) -> BrokerResult<()>;

    fn backend_name(&self) -> &'static str;
}
