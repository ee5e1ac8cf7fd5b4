//! Event channel contract.
//!
//! The channel decouples the decision path from the persistence path. It is
//! durable, ordered per partition key and delivers at least once: the
//! subscriber acknowledges each [`Delivery`] explicitly, and anything not
//! acknowledged is delivered again.
//!
//! ```text
//! Gateway ──publish──▶ [ topic / partition by user ] ──Delivery──▶ Persister
//!                                                        ▲           │
//!                                                        └── nack ───┤
//!                                                            ack ────┘
//! ```
//!
//! Subscribers must be idempotent. Redelivery after a crash is expected and is
//! not prevented here.

use crate::event::SerializedEvent;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during channel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel (or the in-process publisher in front of it) is gone.
    #[error("Event channel unavailable: {0}")]
    Unavailable(String),

    /// The bounded publish buffer is full.
    #[error("Event channel saturated")]
    Saturated,

    /// Failed to publish an event to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Boxed future returned by channel methods.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ChannelError>> + Send + 'a>>;

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, ChannelError>> + Send>>;

/// Broker-side handle that settles one delivery.
pub trait Acknowledger: Send + Sync {
    /// Mark the delivery as processed.
    fn ack(&self) -> ChannelFuture<'_, ()>;

    /// Reject the delivery so it is delivered again later.
    fn nack(&self) -> ChannelFuture<'_, ()>;
}

/// One message handed to a subscriber, together with its ack handle.
///
/// Settling consumes the delivery, so a message can be acked or nacked at most
/// once.
pub struct Delivery {
    /// The envelope as published.
    pub event: SerializedEvent,

    /// How many times this message has been handed out, starting at 1.
    pub delivery_count: u32,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(event: SerializedEvent, delivery_count: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            event,
            delivery_count,
            acker,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AckFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), ChannelError> {
        self.acker.ack().await
    }

    /// Reject the delivery so that it is redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AckFailed`] if the broker rejects the nack.
    pub async fn nack(self) -> Result<(), ChannelError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

/// Durable at-least-once publish/subscribe channel.
///
/// # Dyn Compatibility
///
/// Methods return explicit boxed futures so the channel can be shared as
/// `Arc<dyn EventChannel>` between the publisher task and the persister.
pub trait EventChannel: Send + Sync {
    /// Publish one event to a topic. Resolves once the broker accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] or [`ChannelError::Unavailable`]
    /// if the broker did not accept the event.
    fn publish<'a>(&'a self, topic: &'a str, event: &'a SerializedEvent) -> ChannelFuture<'a, ()>;

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription cannot
    /// be established.
    fn subscribe<'a>(&'a self, topic: &'a str) -> ChannelFuture<'a, DeliveryStream>;
}
