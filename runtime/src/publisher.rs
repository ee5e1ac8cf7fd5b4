//! Bounded publish buffer between the gateway and the event channel.
//!
//! The gateway must never wait on the broker. It hands each event to
//! [`EventPublisher::try_publish`], which only pushes into a bounded in-process
//! queue; a background task drains the queue into the [`EventChannel`],
//! retrying with backoff while the broker is unavailable.
//!
//! ```text
//! grab ─try_publish─▶ [ bounded mpsc ] ─▶ publisher task ─publish─▶ channel
//!          │                                   │
//!          └─ Saturated when full              └─ retries until accepted
//! ```
//!
//! Events that do not fit are reported to the caller and counted; the
//! reconciler repairs the counter-side effect of a lost grant event.

use crate::metrics::PublishMetrics;
use crate::retry::RetryPolicy;
use flashgrab_core::event::{PipelineEvent, SerializedEvent};
use flashgrab_core::event_channel::{ChannelError, EventChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Topic every event is published to.
    pub topic: String,
    /// Events the buffer holds before `try_publish` reports saturation.
    pub buffer: usize,
    /// Backoff between broker retries. `max_retries` is ignored: the task
    /// keeps retrying until the event is accepted or shutdown is requested.
    pub retry: RetryPolicy,
}

impl PublisherConfig {
    /// Defaults for `topic`: 10 000 buffered events, 50ms to 2s backoff.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            buffer: 10_000,
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(2))
                .build(),
        }
    }

    /// Set the buffer size.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Cloneable, non-blocking handle to the publish buffer.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    sender: mpsc::Sender<SerializedEvent>,
}

impl EventPublisher {
    /// Start the background publisher.
    ///
    /// The task stops when `shutdown` fires or every handle is dropped; either
    /// way it makes one last attempt for each event still in the buffer.
    #[must_use]
    pub fn spawn(
        channel: Arc<dyn EventChannel>,
        config: PublisherConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.buffer.max(1));
        let task = PublisherTask {
            channel,
            topic: config.topic,
            retry: config.retry,
            receiver,
            shutdown,
        };
        let handle = tokio::spawn(task.run());
        (Self { sender }, handle)
    }

    /// Enqueue an event without waiting.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Saturated`] if the buffer is full
    /// - [`ChannelError::Unavailable`] if the publisher task has stopped
    /// - [`ChannelError::Transport`] if the event cannot be encoded
    pub fn try_publish(&self, event: &PipelineEvent) -> Result<(), ChannelError> {
        let envelope = SerializedEvent::from_event(event)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        match self.sender.try_send(envelope) {
            Ok(()) => {
                PublishMetrics::record_enqueued(self.depth());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                PublishMetrics::record_failure("saturated");
                Err(ChannelError::Saturated)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                PublishMetrics::record_failure("closed");
                Err(ChannelError::Unavailable("publisher stopped".to_string()))
            }
        }
    }

    /// Events waiting in the buffer.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

struct PublisherTask {
    channel: Arc<dyn EventChannel>,
    topic: String,
    retry: RetryPolicy,
    receiver: mpsc::Receiver<SerializedEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl PublisherTask {
    async fn run(mut self) {
        tracing::info!(topic = %self.topic, "Event publisher started");
        let mut carry: Option<SerializedEvent> = None;

        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                next = self.receiver.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if let Err(envelope) = self.publish_until_accepted(envelope).await {
                carry = Some(envelope);
                break;
            }
            PublishMetrics::record_depth(self.receiver.len());
        }

        self.drain(carry).await;
    }

    /// Returns the envelope back if shutdown interrupted the retries.
    async fn publish_until_accepted(
        &mut self,
        envelope: SerializedEvent,
    ) -> Result<(), SerializedEvent> {
        let mut attempt = 0;
        loop {
            match self.channel.publish(&self.topic, &envelope).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    PublishMetrics::record_retry();
                    tracing::warn!(
                        topic = %self.topic,
                        event_type = %envelope.event_type,
                        attempt,
                        %error,
                        "Publish failed, retrying"
                    );
                    let delay = self.retry.jittered_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = self.shutdown.recv() => return Err(envelope),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn drain(mut self, carry: Option<SerializedEvent>) {
        self.receiver.close();
        let mut lost = 0_u64;
        let mut flushed = 0_u64;

        let mut pending = carry;
        loop {
            let envelope = match pending.take() {
                Some(envelope) => envelope,
                None => match self.receiver.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };
            match self.channel.publish(&self.topic, &envelope).await {
                Ok(()) => flushed += 1,
                Err(error) => {
                    lost += 1;
                    tracing::error!(
                        event_type = %envelope.event_type,
                        key = %envelope.key,
                        %error,
                        "Event dropped during publisher shutdown"
                    );
                }
            }
        }

        PublishMetrics::record_depth(0);
        if lost > 0 {
            tracing::error!(lost, flushed, "Event publisher stopped with unpublished events");
        } else {
            tracing::info!(flushed, "Event publisher stopped");
        }
    }
}
