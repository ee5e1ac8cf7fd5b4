//! Redpanda event channel for the flashgrab pipeline.
//!
//! Implements [`EventChannel`] over any Kafka-compatible broker with rdkafka.
//!
//! # Wire format
//!
//! | Kafka field | Envelope field |
//! |-------------|----------------|
//! | key | `SerializedEvent::key` (user id, so one user's events stay ordered) |
//! | payload | `SerializedEvent::data` (bincode event body) |
//! | header `event_type` | `SerializedEvent::event_type` |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - `ack` commits once every lower offset on the partition is settled
//! - `nack` seeks the partition back to its lowest unsettled offset, so the
//!   message and anything after it is delivered again
//! - a crash before commit redelivers from the last committed offset
//!
//! Delivery counts are kept in process memory; after a restart they start
//! again at 1.
//!
//! # Example
//!
//! ```no_run
//! use flashgrab_core::event_channel::EventChannel;
//! use flashgrab_redpanda::RedpandaEventChannel;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = RedpandaEventChannel::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("flashgrab-persister")
//!     .build()?;
//!
//! let mut deliveries = channel.subscribe("flashgrab-events").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     delivery?.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Commit bookkeeping for out-of-order settlement.
pub mod offsets;

pub use offsets::OffsetTracker;

use flashgrab_core::event::SerializedEvent;
use flashgrab_core::event_channel::{
    Acknowledger, ChannelError, ChannelFuture, Delivery, DeliveryStream, EventChannel,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const EVENT_TYPE_HEADER: &str = "event_type";

fn lock(tracker: &Mutex<OffsetTracker>) -> MutexGuard<'_, OffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_publish_error(topic: &str, error: &KafkaError) -> ChannelError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => ChannelError::Saturated,
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure,
        ) => ChannelError::Unavailable(error.to_string()),
        _ => ChannelError::PublishFailed {
            topic: topic.to_string(),
            reason: error.to_string(),
        },
    }
}

fn envelope_from(message: &BorrowedMessage<'_>) -> SerializedEvent {
    let event_type = message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == EVENT_TYPE_HEADER)
                .and_then(|header| header.value)
        })
        .map(|value| String::from_utf8_lossy(value).into_owned())
        .unwrap_or_default();
    let key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned())
        .unwrap_or_default();
    let data = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

    SerializedEvent::new(event_type, key, data)
}

/// Redpanda-backed [`EventChannel`].
///
/// The producer is created once and shared; each [`EventChannel::subscribe`]
/// call creates its own consumer in the configured group.
pub struct RedpandaEventChannel {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventChannel {
    /// Create a channel with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, ChannelError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the channel.
    #[must_use]
    pub fn builder() -> RedpandaEventChannelBuilder {
        RedpandaEventChannelBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaEventChannel`].
///
/// ```no_run
/// use flashgrab_redpanda::RedpandaEventChannel;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = RedpandaEventChannel::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaEventChannelBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventChannelBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. A publish is only reported as accepted once every
    /// in-sync replica has it.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every persister instance.
    ///
    /// Default: `"flashgrab-persister"`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Deliveries buffered between the consumer task and the subscriber.
    ///
    /// Default: 1000. Values below 1 are raised to 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a group without a committed offset starts reading.
    ///
    /// Default: `"earliest"`, so a fresh persister group sees every event.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventChannel`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventChannel, ChannelError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChannelError::Unavailable("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| ChannelError::Unavailable(format!("Failed to create producer: {e}")))?;

        let channel = RedpandaEventChannel {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "flashgrab-persister".to_string()),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %channel.brokers,
            acks = %acks,
            compression = %compression,
            consumer_group = %channel.consumer_group,
            buffer_size = channel.buffer_size,
            "RedpandaEventChannel created"
        );
        Ok(channel)
    }
}

/// Settles one Kafka message through the shared consumer.
struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledger for KafkaAcker {
    fn ack(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let Some(commit) = lock(&self.tracker).acked(self.partition, self.offset) else {
                return Ok(());
            };

            let mut positions = TopicPartitionList::new();
            positions
                .add_partition_offset(&self.topic, self.partition, Offset::Offset(commit))
                .map_err(|e| ChannelError::AckFailed(e.to_string()))?;
            self.consumer
                .commit(&positions, CommitMode::Async)
                .map_err(|e| ChannelError::AckFailed(e.to_string()))?;

            tracing::trace!(
                topic = %self.topic,
                partition = self.partition,
                offset = commit,
                "Offset committed"
            );
            Ok(())
        })
    }

    fn nack(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let rewind = lock(&self.tracker)
                .rewind_point(self.partition)
                .unwrap_or(self.offset)
                .min(self.offset);

            self.consumer
                .seek(
                    &self.topic,
                    self.partition,
                    Offset::Offset(rewind),
                    Timeout::After(Duration::from_secs(5)),
                )
                .map_err(|e| ChannelError::AckFailed(format!("Seek failed: {e}")))?;

            tracing::debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                rewind,
                "Partition rewound for redelivery"
            );
            Ok(())
        })
    }
}

impl EventChannel for RedpandaEventChannel {
    fn publish<'a>(&'a self, topic: &'a str, event: &'a SerializedEvent) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            let headers = OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(event.event_type.as_bytes()),
            });
            let record = FutureRecord::to(topic)
                .payload(&event.data)
                .key(&event.key)
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(
                        topic,
                        partition,
                        offset,
                        event_type = %event.event_type,
                        "Event published"
                    );
                    Ok(())
                },
                Err((error, _)) => {
                    tracing::warn!(topic, %error, "Failed to publish event");
                    Err(map_publish_error(topic, &error))
                },
            }
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> ChannelFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| ChannelError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic])
                .map_err(|e| ChannelError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic,
                consumer_group = %self.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to topic"
            );

            let consumer = Arc::new(consumer);
            let tracker = Arc::new(Mutex::new(OffsetTracker::new()));
            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let topic = topic.to_string();

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                loop {
                    // Leave the group as soon as the subscriber goes away.
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = stream.next() => next,
                    };
                    let Some(next) = next else { break };

                    let item = match next {
                        Ok(message) => {
                            let partition = message.partition();
                            let offset = message.offset();
                            let count = lock(&tracker).delivered(partition, offset);
                            let acker = KafkaAcker {
                                consumer: Arc::clone(&consumer),
                                tracker: Arc::clone(&tracker),
                                topic: topic.clone(),
                                partition,
                                offset,
                            };
                            Ok(Delivery::new(envelope_from(&message), count, Box::new(acker)))
                        },
                        Err(e) => Err(ChannelError::Transport(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    if tx.send(item).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break;
                    }
                }
                tracing::debug!(in_flight = lock(&tracker).in_flight(), "Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_channel_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventChannel>();
        assert_sync::<RedpandaEventChannel>();
    }

    #[test]
    fn build_without_brokers_fails() {
        assert!(matches!(
            RedpandaEventChannel::builder().build(),
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[test]
    fn queue_full_is_saturation() {
        let error = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert_eq!(map_publish_error("events", &error), ChannelError::Saturated);

        let error = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(matches!(map_publish_error("events", &error), ChannelError::Unavailable(_)));

        let error = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            map_publish_error("events", &error),
            ChannelError::PublishFailed { .. }
        ));
    }
}
