//! Message broker transport.
//!
//! Stages only see the [`Broker`] and [`Subscription`] traits. Delivery is
//! at-least-once: a message that is not finished before its connection drops
//! comes back, possibly to another consumer.
//!
//! - [`NsqBroker`] - `nsqd` over TCP (protocol V2)
//! - [`MemoryBroker`] - in-process topics and channels, for tests

mod memory;
mod nsq;

pub use memory::{MemoryBroker, MemorySubscription};
pub use nsq::{
    Command, Frame, NsqBroker, NsqCodec, NsqConfig, NsqSubscription, validate_name,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Broker-assigned message id.
pub type MessageId = [u8; 16];

/// One message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    /// Number of times the broker has handed this message out.
    pub attempts: u16,
    /// Broker timestamp in nanoseconds.
    pub timestamp: i64,
    pub body: Bytes,
}

/// Publish side of a pub/sub broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe `channel` to `topic`. Fails if the broker is unreachable.
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Publish one message to `topic`.
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;
}

/// An open channel subscription delivering one message at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Acknowledge `delivery` so it is not redelivered.
    async fn finish(&mut self, delivery: &Delivery) -> Result<()>;

    /// Stop receiving. In-flight unfinished messages are returned to the broker.
    async fn close(&mut self) -> Result<()>;
}
