//! Message bus abstraction shared by the RPC and event-dispatch layers.
//!
//! The bus is assumed to be a reliable, partition-ordered publish/subscribe
//! topic service reachable over the network (Kafka-compatible in production,
//! an in-memory broadcast in tests). Payloads are opaque bytes: the same bus
//! carries RPC envelopes and serialized domain events, so encoding decisions
//! stay with the layers that own the types.
//!
//! # Ordering
//!
//! Messages published with the same `key` land on the same partition and are
//! delivered in publish order. The RPC layer keys requests by partition key
//! (typically a device id) and replies by correlation id to get per-call and
//! per-device ordering out of this single guarantee.
//!
//! # Example
//!
//! ```rust,ignore
//! use devicemesh_core::bus::MessageBus;
//! use futures::StreamExt;
//!
//! async fn example(bus: &dyn MessageBus) {
//!     bus.publish("device-requests", Some("device-42"), vec![1, 2, 3]).await?;
//!
//!     let mut stream = bus.subscribe(&["device-replies"]).await?;
//!     while let Some(result) = stream.next().await {
//!         match result {
//!             Ok(message) => println!("{} bytes on {}", message.payload.len(), message.topic),
//!             Err(e) => eprintln!("bus error: {e}"),
//!         }
//!     }
//! }
//! ```

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the bus.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error while consuming.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A single message received from the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was consumed from.
    pub topic: String,

    /// Partition key the message was published with, if any.
    pub key: Option<String>,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Stream of messages from a subscription.
///
/// Each item is a `Result` so transport errors surface in-band without
/// terminating the stream; consumers log and keep polling.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BusMessage, BusError>> + Send>>;

/// Trait for message bus implementations.
///
/// Implementations must be `Send + Sync`; the bus is shared behind an
/// `Arc<dyn MessageBus>` between the RPC client, the RPC server and the event
/// dispatch plumbing. The trait uses explicit `Pin<Box<dyn Future>>` returns
/// instead of `async fn` so it stays dyn-compatible.
///
/// # Delivery semantics
///
/// At-least-once: a message may be delivered more than once after a consumer
/// restart. Per-partition ordering is guaranteed for messages sharing a key;
/// nothing is guaranteed across keys or topics.
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// Messages with the same `key` are delivered to subscribers in publish
    /// order. A `None` key lets the bus pick any partition.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the message cannot be handed to
    /// the bus within the implementation's send timeout.
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a merged message stream.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the consumer cannot be
    /// created or attached to the topics.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_message_equality_ignores_nothing() {
        let a = BusMessage {
            topic: "t".to_string(),
            key: Some("k".to_string()),
            payload: vec![1, 2],
        };
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn bus_error_display_names_topic() {
        let err = BusError::PublishFailed {
            topic: "device-requests".to_string(),
            reason: "broker down".to_string(),
        };
        assert!(err.to_string().contains("device-requests"));
    }
}
