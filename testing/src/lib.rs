//! # Devicemesh Testing
//!
//! Testing utilities for the devicemesh backend.
//!
//! The centerpiece is [`InMemoryMessageBus`], a broadcast-channel
//! implementation of the [`MessageBus`] trait: fast, dependency-free, and
//! faithful to the production bus's topic semantics — subscribers only see
//! messages published after they subscribed, and messages with the same key
//! on one topic arrive in publish order.
//!
//! ## Example
//!
//! ```ignore
//! use devicemesh_testing::InMemoryMessageBus;
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn round_trip() {
//!     let bus = Arc::new(InMemoryMessageBus::new());
//!     let mut stream = bus.subscribe(&["replies"]).await.unwrap();
//!     bus.publish("replies", None, vec![1, 2, 3]).await.unwrap();
//!     // stream.next().await yields the message
//! }
//! ```

use devicemesh_core::bus::{BusError, BusMessage, MessageBus, MessageStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

/// Default per-topic buffer of the in-memory bus.
const DEFAULT_CAPACITY: usize = 256;

/// In-memory [`MessageBus`] backed by one broadcast channel per topic.
///
/// Publishing to a topic nobody subscribed to succeeds and drops the message,
/// matching a real bus with no consumers attached. A subscriber that falls
/// more than the buffer capacity behind observes a [`BusError::Transport`]
/// item and keeps receiving from the oldest retained message.
pub struct InMemoryMessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    /// Create a bus with the default per-topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<BusMessage>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.lock();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let message = BusMessage {
            topic: topic.to_owned(),
            key: key.map(ToOwned::to_owned),
            payload,
        };
        let sender = self.sender_for(topic);
        Box::pin(async move {
            // No receivers is fine: the message just has no audience.
            sender.send(message).ok();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let receivers: Vec<(String, broadcast::Receiver<BusMessage>)> = topics
            .iter()
            .map(|topic| ((*topic).to_owned(), self.sender_for(topic).subscribe()))
            .collect();

        Box::pin(async move {
            // Bridge every topic receiver into one merged stream, the same
            // shape the production consumer task uses.
            let (tx, rx) = mpsc::unbounded_channel::<Result<BusMessage, BusError>>();
            for (topic, mut receiver) in receivers {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(message) => {
                                if tx.send(Ok(message)).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                let err = BusError::Transport(format!(
                                    "subscriber lagged, {skipped} messages dropped on '{topic}'"
                                ));
                                if tx.send(Err(err)).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

/// Install a compact tracing subscriber for a test, if none is set yet.
///
/// Safe to call from every test; only the first call wins.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_then_subscribe_misses_earlier_messages() {
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.publish("t", None, vec![1]).await.unwrap();

        let mut stream = bus.subscribe(&["t"]).await.unwrap();
        bus.publish("t", None, vec![2]).await.unwrap();

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.payload, vec![2]);
    }

    #[tokio::test]
    async fn subscribe_merges_topics() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let mut stream = bus.subscribe(&["a", "b"]).await.unwrap();

        bus.publish("a", Some("k"), vec![1]).await.unwrap();
        bus.publish("b", None, vec![2]).await.unwrap();

        let mut seen = vec![
            stream.next().await.unwrap().unwrap(),
            stream.next().await.unwrap().unwrap(),
        ];
        seen.sort_by(|x, y| x.topic.cmp(&y.topic));
        assert_eq!(seen[0].topic, "a");
        assert_eq!(seen[0].key.as_deref(), Some("k"));
        assert_eq!(seen[1].topic, "b");
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.publish("empty", None, vec![0]).await.is_ok());
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_message() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let mut first = bus.subscribe(&["t"]).await.unwrap();
        let mut second = bus.subscribe(&["t"]).await.unwrap();

        bus.publish("t", None, vec![7]).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap().payload, vec![7]);
        assert_eq!(second.next().await.unwrap().unwrap().payload, vec![7]);
    }
}
