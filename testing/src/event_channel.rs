//! In-memory event channel with redelivery.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use flashgrab_core::event::SerializedEvent;
use flashgrab_core::event_channel::{
    Acknowledger, ChannelError, ChannelFuture, Delivery, DeliveryStream, EventChannel,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Message = (SerializedEvent, u32);

struct Topic {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    nacked: AtomicU64,
}

/// Single-consumer-group channel that keeps unacknowledged messages.
///
/// A nacked delivery goes to the back of its topic with its delivery count
/// bumped. Dropping a [`Delivery`] without settling it loses it, which is
/// the in-memory stand-in for "the broker will redeliver after the session
/// times out"; tests that care settle every delivery.
///
/// Publishing before anybody subscribed is fine: messages wait in the topic.
#[derive(Clone, Default)]
pub struct InMemoryEventChannel {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    published: Arc<Mutex<Vec<(String, SerializedEvent)>>>,
    unavailable: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl InMemoryEventChannel {
    /// Create an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject publishes (and subscriptions) until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every envelope accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published.lock().unwrap().clone()
    }

    /// Number of acknowledged deliveries.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.counters.acked.load(Ordering::SeqCst)
    }

    /// Number of negatively acknowledged deliveries.
    #[must_use]
    pub fn nacked(&self) -> u64 {
        self.counters.nacked.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> mpsc::UnboundedSender<Message> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .sender
            .clone()
    }

    fn receiver(&self, topic: &str) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>> {
        Arc::clone(
            &self
                .topics
                .lock()
                .unwrap()
                .entry(topic.to_string())
                .or_insert_with(Topic::new)
                .receiver,
        )
    }

    fn check_available(&self, topic: &str) -> Result<(), ChannelError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChannelError::PublishFailed {
                topic: topic.to_string(),
                reason: "in-memory channel marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

struct InMemoryAcker {
    message: Message,
    sender: mpsc::UnboundedSender<Message>,
    counters: Arc<Counters>,
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            self.counters.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn nack(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            self.counters.nacked.fetch_add(1, Ordering::SeqCst);
            let (event, count) = self.message.clone();
            self.sender
                .send((event, count + 1))
                .map_err(|e| ChannelError::AckFailed(e.to_string()))
        })
    }
}

impl EventChannel for InMemoryEventChannel {
    fn publish<'a>(&'a self, topic: &'a str, event: &'a SerializedEvent) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            self.check_available(topic)?;
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), event.clone()));
            self.sender(topic)
                .send((event.clone(), 1))
                .map_err(|e| ChannelError::PublishFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> ChannelFuture<'a, DeliveryStream> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(ChannelError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "in-memory channel marked unavailable".to_string(),
                });
            }

            let receiver = self.receiver(topic);
            let sender = self.sender(topic);
            let counters = Arc::clone(&self.counters);

            let stream = async_stream::stream! {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(message) = next else { break };
                    let acker = InMemoryAcker {
                        message: message.clone(),
                        sender: sender.clone(),
                        counters: Arc::clone(&counters),
                    };
                    yield Ok(Delivery::new(message.0, message.1, Box::new(acker)));
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn envelope(key: &str) -> SerializedEvent {
        SerializedEvent::new("Test.v1".to_string(), key.to_string(), vec![1])
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_count() {
        let channel = InMemoryEventChannel::new();
        channel.publish("t", &envelope("a")).await.unwrap();

        let mut stream = channel.subscribe("t").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        first.nack().await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.event.key, "a");
        second.ack().await.unwrap();

        assert_eq!(channel.acked(), 1);
        assert_eq!(channel.nacked(), 1);
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_publish() {
        let channel = InMemoryEventChannel::new();
        channel.set_unavailable(true);
        assert!(channel.publish("t", &envelope("a")).await.is_err());
        assert!(channel.published().is_empty());
    }
}
