//! In-process broker with NSQ-like topic/channel semantics.
//!
//! Every channel on a topic receives its own copy of each message. Messages
//! published before a topic has any channel are held and handed to the first
//! channel that subscribes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, Delivery, MessageId, Subscription};
use crate::error::{Error, Result};

#[derive(Default)]
struct TopicState {
    channels: HashMap<String, ChannelState>,
    /// Held until the first channel subscribes.
    backlog: Vec<Delivery>,
    /// Every message ever published, in order.
    history: Vec<Bytes>,
}

struct ChannelState {
    sender: mpsc::UnboundedSender<Delivery>,
    finished: Arc<AtomicU64>,
}

/// In-memory [`Broker`] for tests and dry runs.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every body published to `topic` so far, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.topics
            .lock()
            .get(topic)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Number of messages finished on `topic`/`channel`.
    pub fn finished(&self, topic: &str, channel: &str) -> u64 {
        self.topics
            .lock()
            .get(topic)
            .and_then(|state| state.channels.get(channel))
            .map_or(0, |channel| channel.finished.load(Ordering::SeqCst))
    }

    fn next_message_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut id = [0u8; 16];
        id.copy_from_slice(format!("{n:016x}").as_bytes());
        id
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>> {
        super::validate_name(topic)?;
        super::validate_name(channel)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicU64::new(0));

        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        if state.channels.is_empty() {
            for delivery in state.backlog.drain(..) {
                // The receiver is alive in this scope.
                let _ = sender.send(delivery);
            }
        }
        state.channels.insert(
            channel.to_string(),
            ChannelState {
                sender,
                finished: Arc::clone(&finished),
            },
        );

        Ok(Box::new(MemorySubscription { receiver, finished }))
    }

    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        super::validate_name(topic)?;

        let delivery = Delivery {
            id: self.next_message_id(),
            attempts: 1,
            timestamp: 0,
            body: body.clone(),
        };

        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.history.push(body);

        state
            .channels
            .retain(|_, channel| channel.sender.send(delivery.clone()).is_ok());
        if state.channels.is_empty() {
            state.backlog.push(delivery);
        }
        Ok(())
    }
}

/// Subscription handed out by [`MemoryBroker`].
pub struct MemorySubscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
    finished: Arc<AtomicU64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    async fn finish(&mut self, _delivery: &Delivery) -> Result<()> {
        if self.receiver.is_closed() {
            return Err(Error::Closed);
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_delivered_to_first_channel() {
        let broker = MemoryBroker::new();
        broker.publish("zdns", Bytes::from_static(b"a")).await.unwrap();
        broker.publish("zdns", Bytes::from_static(b"b")).await.unwrap();

        let mut sub = broker.subscribe("zdns", "orchestrator").await.unwrap();
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(&first.body[..], b"a");
        assert_eq!(&second.body[..], b"b");
        assert_ne!(first.id, second.id);

        sub.finish(&first).await.unwrap();
        assert_eq!(broker.finished("zdns", "orchestrator"), 1);
    }

    #[tokio::test]
    async fn test_each_channel_gets_a_copy() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("zgrab", "a").await.unwrap();
        let mut b = broker.subscribe("zgrab", "b").await.unwrap();

        broker.publish("zgrab", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(&a.next().await.unwrap().body[..], b"x");
        assert_eq!(&b.next().await.unwrap().body[..], b"x");
        assert_eq!(broker.published("zgrab"), vec![Bytes::from_static(b"x")]);
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("zdns", "orchestrator").await.unwrap();
        sub.close().await.unwrap();
        assert!(sub.next().await.is_none());

        // Publishing after the only channel closed goes back to the backlog.
        broker.publish("zdns", Bytes::from_static(b"late")).await.unwrap();
        let mut again = broker.subscribe("zdns", "orchestrator").await.unwrap();
        assert_eq!(&again.next().await.unwrap().body[..], b"late");
    }

    #[tokio::test]
    async fn test_rejects_bad_topic() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("no spaces", Bytes::new()).await.is_err());
        assert!(broker.subscribe("ok", "").await.is_err());
    }
}
