//! Kafka-compatible message bus for devicemesh.
//!
//! This crate implements the [`MessageBus`] trait from `devicemesh-core` on
//! top of rdkafka. Any Kafka-protocol broker works: Apache Kafka, Redpanda,
//! AWS MSK, Azure Event Hubs.
//!
//! # Delivery semantics
//!
//! At-least-once with manual offset commits: an offset is committed only
//! after the message has been handed to the subscriber's channel. A crash
//! before the commit redelivers the message, so consumers must tolerate
//! duplicates — the RPC layer does, because a redelivered reply is either an
//! orphan (already completed) or an idempotent re-completion of a streaming
//! part.
//!
//! # Ordering
//!
//! Publishes carry an optional partition key. Messages sharing a key land on
//! one partition and stay ordered, which is what gives the RPC layer per-call
//! reply ordering (keyed by correlation id) and the request path per-device
//! ordering (keyed by device id).
//!
//! # Example
//!
//! ```no_run
//! use devicemesh_kafka::KafkaMessageBus;
//! use devicemesh_core::bus::MessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("frontend-node-1")
//!     .build()?;
//!
//! bus.publish("device-requests", Some("device-42"), vec![1, 2, 3]).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use devicemesh_core::bus::{BusError, BusMessage, MessageBus, MessageStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Kafka-backed [`MessageBus`].
///
/// One instance owns a single producer; every [`MessageBus::subscribe`] call
/// creates its own consumer, so the RPC client and server can share a bus
/// while consuming different topics.
pub struct KafkaMessageBus {
    producer: FutureProducer,
    brokers: String,
    send_timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl KafkaMessageBus {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be
    /// created from the broker list.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> KafkaMessageBusBuilder {
        KafkaMessageBusBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`KafkaMessageBus`].
#[derive(Default)]
pub struct KafkaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    send_timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaMessageBusBuilder {
    /// Comma-separated broker addresses, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`. Default `"1"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    /// Default `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default 5 seconds.
    #[must_use]
    pub const fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Consumer group id for subscriptions.
    ///
    /// Every node needs its own group for reply topics — replies must reach
    /// the node that issued the request, not be load-balanced away from it.
    /// When unset, a group name is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// In-process buffer between the Kafka consumer and the subscriber.
    /// Default 1000.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts reading: `"earliest"`, `"latest"`
    /// or `"error"`. Default `"latest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if no brokers were set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<KafkaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "kafka message bus created"
        );

        Ok(KafkaMessageBus {
            producer,
            brokers,
            send_timeout: self.send_timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl MessageBus for KafkaMessageBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.map(ToOwned::to_owned);
        let send_timeout = self.send_timeout;

        Box::pin(async move {
            let mut record: FutureRecord<'_, str, Vec<u8>> =
                FutureRecord::to(&topic).payload(&payload);
            if let Some(key) = key.as_deref() {
                record = record.key(key);
            }

            match self
                .producer
                .send(record, Timeout::After(send_timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = key.as_deref().unwrap_or(""),
                        "message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "publish failed");
                    Err(BusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer_group_id = consumer_group.unwrap_or_else(|| {
                let mut sorted = topics.clone();
                sorted.sort();
                format!("devicemesh-{}", sorted.join("-"))
            });

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size,
                "subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The spawned task owns the consumer and forwards messages;
            // offsets are committed only after the in-process hand-off.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(message) => {
                            let bus_message = BusMessage {
                                topic: message.topic().to_owned(),
                                key: message
                                    .key()
                                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                                payload: message.payload().unwrap_or_default().to_vec(),
                            };
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "message received"
                            );

                            if tx.send(Ok(bus_message)).await.is_err() {
                                tracing::debug!("subscriber dropped, consumer task exiting");
                                break; // exit WITHOUT committing
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "offset commit failed, message may be redelivered"
                                );
                            }
                        }
                        Err(e) => {
                            let err = BusError::Transport(format!("consume failed: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
