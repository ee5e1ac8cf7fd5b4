//! Decision gateway: the synchronous half of a grab.
//!
//! One grab is one bounded decrement against the counter store, optionally
//! followed by a set-if-absent duplicate marker, and a non-blocking hand-off of
//! the resulting [`GrabEvent`] to the publish buffer. The gateway never touches
//! the ledger.
//!
//! ```text
//!  validate ──▶ bounded_decrement ──Applied──▶ mark_once ──new──▶ Granted
//!     │                │                          │
//!     │                ├─Refused─▶ OutOfStock     └─existing─▶ increment ─▶ Duplicate
//!     │                └─Missing─▶ NotInitialized
//!     └─blank ids─▶ Invalid
//! ```
//!
//! Every outcome, including denials, is answered only after the decision is
//! final. Infrastructure failures are returned as [`GrabError`]s and are never
//! turned into denials.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::metrics::GrabMetrics;
use crate::publisher::EventPublisher;
use flashgrab_core::counter_store::{CounterStore, CounterStoreError, Decrement};
use flashgrab_core::environment::Clock;
use flashgrab_core::event::PipelineEvent;
use flashgrab_core::event_channel::ChannelError;
use flashgrab_core::types::{
    DenialReason, EventId, GrabEvent, LikeEvent, Outcome, ResourceId, UserId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors a grab can end with instead of a decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrabError {
    /// A counter store call timed out. The decrement may or may not have
    /// applied; a retry is safe when duplicate protection is on.
    #[error("Counter store call '{operation}' for {resource} timed out; outcome unknown")]
    Indeterminate {
        /// Store operation that timed out.
        operation: &'static str,
        /// Resource of the grab.
        resource: String,
    },

    /// The counter store failed or the circuit breaker is open.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The resource has no live counter; bootstrap has not run for it.
    #[error("Resource not initialized: {0}")]
    NotInitialized(String),

    /// The request itself is unusable (like requests only; grabs answer
    /// `Denied(Invalid)` instead).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A like event could not be handed to the publisher.
    #[error("Event not accepted for publishing: {0}")]
    Channel(ChannelError),
}

impl GrabError {
    /// Whether the caller may retry the same request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Indeterminate { .. } | Self::Unavailable(_) | Self::Channel(_)
        )
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Indeterminate { .. } => "indeterminate",
            Self::Unavailable(_) => "unavailable",
            Self::NotInitialized(_) => "not_initialized",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Channel(_) => "channel",
        }
    }
}

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Enforce one grant per user and resource.
    pub duplicate_protection: bool,
    /// Publish denied outcomes too (off = only grants reach the ledger).
    pub publish_denials: bool,
    /// Upper bound for each counter store round trip.
    pub counter_timeout: Duration,
    /// Breaker in front of the counter store.
    pub breaker: CircuitBreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            duplicate_protection: true,
            publish_denials: true,
            counter_timeout: Duration::from_millis(250),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Answer to one grab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabResponse {
    /// The decision.
    pub outcome: Outcome,
    /// Counter value after the decision; 0 when out of stock.
    pub remaining_stock: i64,
    /// Idempotency key of the emitted event.
    pub event_id: EventId,
    /// Time spent deciding.
    pub latency: Duration,
    /// Whether the event entered the publish buffer.
    pub event_enqueued: bool,
}

/// Answer to one like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeResponse {
    /// Idempotency key of the emitted event.
    pub event_id: EventId,
    /// Whether the like was promoted to the top board.
    pub is_top_like: bool,
}

enum CallError {
    Open,
    Timeout,
    Store(CounterStoreError),
}

/// Accepts grab and like requests.
#[derive(Clone)]
pub struct DecisionGateway {
    store: Arc<dyn CounterStore>,
    publisher: EventPublisher,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    config: Arc<GatewayConfig>,
}

impl DecisionGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new("counter_store", config.breaker.clone()),
            store,
            publisher,
            clock,
            config: Arc::new(config),
        }
    }

    /// The breaker guarding the counter store.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Decide one grab.
    ///
    /// # Errors
    ///
    /// - [`GrabError::Indeterminate`] when a counter store call timed out
    /// - [`GrabError::Unavailable`] when the store failed or the breaker is open
    /// - [`GrabError::NotInitialized`] when the resource was never seeded
    pub async fn grab(
        &self,
        user: &UserId,
        resource: &ResourceId,
    ) -> Result<GrabResponse, GrabError> {
        let started = Instant::now();
        let event_id = EventId::new();

        let decided = self.decide(user, resource, &event_id).await;
        let (outcome, remaining_stock) = match decided {
            Ok(decision) => decision,
            Err(error) => {
                GrabMetrics::record_infra_error(error.kind());
                tracing::warn!(
                    user_id = %user,
                    resource_id = %resource,
                    %error,
                    retryable = error.is_retryable(),
                    "Grab failed before a decision"
                );
                return Err(error);
            }
        };

        let event = GrabEvent {
            event_id,
            user_id: user.clone(),
            resource_id: resource.clone(),
            outcome,
            stock_snapshot: remaining_stock,
            occurred_at: self.clock.now(),
        };
        let event_enqueued = self.enqueue(event);

        let latency = started.elapsed();
        GrabMetrics::record_decision(&outcome, latency);
        tracing::debug!(
            user_id = %user,
            resource_id = %resource,
            %outcome,
            remaining_stock,
            %event_id,
            "Grab decided"
        );

        Ok(GrabResponse {
            outcome,
            remaining_stock,
            event_id,
            latency,
            event_enqueued,
        })
    }

    /// Record a like. No stock is involved.
    ///
    /// # Errors
    ///
    /// - [`GrabError::InvalidRequest`] for a blank user id
    /// - [`GrabError::Channel`] if the publish buffer rejected the event
    pub fn like(&self, user: &UserId) -> Result<LikeResponse, GrabError> {
        if !user.is_valid() {
            return Err(GrabError::InvalidRequest("user_id must not be blank".to_string()));
        }

        let event = LikeEvent {
            event_id: EventId::new(),
            user_id: user.clone(),
            is_top_like: is_top_like(user),
            occurred_at: self.clock.now(),
        };
        let response = LikeResponse {
            event_id: event.event_id,
            is_top_like: event.is_top_like,
        };

        self.publisher
            .try_publish(&PipelineEvent::Like(event))
            .map_err(|error| {
                tracing::error!(user_id = %user, %error, "Like event not enqueued");
                GrabError::Channel(error)
            })?;

        Ok(response)
    }

    /// Decide one grab. `token` is written into the duplicate marker so that
    /// only this attempt can take its own marker back.
    async fn decide(
        &self,
        user: &UserId,
        resource: &ResourceId,
        token: &EventId,
    ) -> Result<(Outcome, i64), GrabError> {
        if !user.is_valid() || !resource.is_valid() {
            return Ok((Outcome::Denied(DenialReason::Invalid), 0));
        }

        let decrement = self
            .guarded("bounded_decrement", resource, self.store.bounded_decrement(resource))
            .await?;

        let remaining = match decrement {
            Decrement::Missing => return Err(GrabError::NotInitialized(resource.to_string())),
            Decrement::Refused => return Ok((Outcome::Denied(DenialReason::OutOfStock), 0)),
            Decrement::Applied { remaining } => remaining,
        };

        if !self.config.duplicate_protection {
            return Ok((Outcome::Granted, remaining));
        }

        match self
            .guarded("mark_once", resource, self.store.mark_once(resource, user, token))
            .await
        {
            Ok(true) => Ok((Outcome::Granted, remaining)),
            Ok(false) => {
                let restored = self.compensate(user, resource).await.unwrap_or(remaining);
                Ok((Outcome::Denied(DenialReason::Duplicate), restored))
            }
            Err(error) => {
                // The marker may have landed; neither it nor the unit is kept.
                self.release_marker(user, resource, token).await;
                self.compensate(user, resource).await;
                Err(error)
            }
        }
    }

    /// Remove a marker this attempt may have written before its reply was lost.
    ///
    /// Bypasses the breaker. On failure the user is answered `Duplicate` on
    /// retry until an admin reset clears the marker.
    async fn release_marker(&self, user: &UserId, resource: &ResourceId, token: &EventId) {
        let result = tokio::time::timeout(
            self.config.counter_timeout,
            self.store.clear_marker(resource, user, token),
        )
        .await;

        match result {
            Ok(Ok(removed)) => {
                tracing::debug!(user_id = %user, resource_id = %resource, removed, "Marker released");
            }
            Ok(Err(error)) => {
                tracing::error!(
                    user_id = %user,
                    resource_id = %resource,
                    %error,
                    "Failed to release duplicate marker"
                );
            }
            Err(_) => {
                tracing::error!(
                    user_id = %user,
                    resource_id = %resource,
                    "Releasing duplicate marker timed out"
                );
            }
        }
    }

    /// Run one counter store call under the breaker and the timeout.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        resource: &ResourceId,
        call: impl Future<Output = Result<T, CounterStoreError>>,
    ) -> Result<T, GrabError> {
        let timeout = self.config.counter_timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(CallError::Store(error)),
                    Err(_) => Err(CallError::Timeout),
                }
            })
            .await
            .map_err(|error| match error {
                CircuitBreakerError::Open => CallError::Open,
                CircuitBreakerError::Inner(inner) => inner,
            });

        result.map_err(|error| match error {
            CallError::Open => GrabError::Unavailable("circuit breaker open".to_string()),
            CallError::Timeout => GrabError::Indeterminate {
                operation,
                resource: resource.to_string(),
            },
            CallError::Store(error) => GrabError::Unavailable(error.to_string()),
        })
    }

    /// Give back a unit taken by a decrement that did not become a grant.
    ///
    /// Bypasses the breaker. A failure leaves the counter one unit low until
    /// the reconciler corrects it.
    async fn compensate(&self, user: &UserId, resource: &ResourceId) -> Option<i64> {
        let result =
            tokio::time::timeout(self.config.counter_timeout, self.store.increment(resource)).await;

        match result {
            Ok(Ok(Some(value))) => {
                GrabMetrics::record_compensation(true);
                Some(value)
            }
            Ok(Ok(None)) => {
                GrabMetrics::record_compensation(false);
                tracing::warn!(
                    user_id = %user,
                    resource_id = %resource,
                    "Counter missing during compensation; left for bootstrap and reconcile"
                );
                None
            }
            Ok(Err(error)) => {
                GrabMetrics::record_compensation(false);
                tracing::error!(
                    user_id = %user,
                    resource_id = %resource,
                    %error,
                    "Compensating increment failed; counter is low until reconciled"
                );
                None
            }
            Err(_) => {
                GrabMetrics::record_compensation(false);
                tracing::error!(
                    user_id = %user,
                    resource_id = %resource,
                    "Compensating increment timed out; counter may be low until reconciled"
                );
                None
            }
        }
    }

    fn enqueue(&self, event: GrabEvent) -> bool {
        if !event.outcome.is_granted() && !self.config.publish_denials {
            return false;
        }

        let event_id = event.event_id;
        let user_id = event.user_id.clone();
        let granted = event.outcome.is_granted();

        match self.publisher.try_publish(&PipelineEvent::Grab(event)) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(
                    %event_id,
                    user_id = %user_id,
                    granted,
                    %error,
                    "Grab event not enqueued; ledger will lag until reconciled"
                );
                false
            }
        }
    }
}

/// One user in ten gets promoted likes, decided by a stable FNV-1a hash of the
/// id so the same user always lands on the same side.
#[must_use]
pub fn is_top_like(user: &UserId) -> bool {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let hash = user
        .as_str()
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
    hash % 10 == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flashgrab_testing::{InMemoryCounterStore, InMemoryEventChannel, test_clock};
    use crate::publisher::PublisherConfig;
    use tokio::sync::broadcast;

    struct Fixture {
        gateway: DecisionGateway,
        store: InMemoryCounterStore,
        _shutdown: broadcast::Sender<()>,
    }

    fn fixture(config: GatewayConfig, stock: i64) -> Fixture {
        let store = InMemoryCounterStore::new();
        store.seed(&ResourceId::new("coupon"), stock);
        let channel = InMemoryEventChannel::new();
        let (shutdown, rx) = broadcast::channel(1);
        let (publisher, _task) =
            EventPublisher::spawn(Arc::new(channel), PublisherConfig::new("events"), rx);
        let gateway = DecisionGateway::new(
            Arc::new(store.clone()),
            publisher,
            Arc::new(test_clock()),
            config,
        );
        Fixture {
            gateway,
            store,
            _shutdown: shutdown,
        }
    }

    fn coupon() -> ResourceId {
        ResourceId::new("coupon")
    }

    #[tokio::test]
    async fn blank_ids_are_denied_without_touching_stock() {
        let f = fixture(GatewayConfig::default(), 5);
        let response = f.gateway.grab(&UserId::new("  "), &coupon()).await.unwrap();
        assert_eq!(response.outcome, Outcome::Denied(DenialReason::Invalid));
        assert_eq!(f.store.value(&coupon()), Some(5));
        assert_eq!(f.store.decrement_calls(), 0);
    }

    #[tokio::test]
    async fn last_unit_then_out_of_stock() {
        let f = fixture(GatewayConfig::default(), 1);
        let first = f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap();
        assert_eq!(first.outcome, Outcome::Granted);
        assert_eq!(first.remaining_stock, 0);

        let second = f.gateway.grab(&UserId::new("b"), &coupon()).await.unwrap();
        assert_eq!(second.outcome, Outcome::Denied(DenialReason::OutOfStock));
        assert_eq!(second.remaining_stock, 0);
        assert_eq!(f.store.value(&coupon()), Some(0));
    }

    #[tokio::test]
    async fn duplicate_is_compensated() {
        let f = fixture(GatewayConfig::default(), 5);
        let user = UserId::new("a");
        f.gateway.grab(&user, &coupon()).await.unwrap();
        let again = f.gateway.grab(&user, &coupon()).await.unwrap();

        assert_eq!(again.outcome, Outcome::Denied(DenialReason::Duplicate));
        assert_eq!(again.remaining_stock, 4);
        assert_eq!(f.store.value(&coupon()), Some(4));
    }

    #[tokio::test]
    async fn duplicates_allowed_when_protection_is_off() {
        let config = GatewayConfig {
            duplicate_protection: false,
            ..GatewayConfig::default()
        };
        let f = fixture(config, 5);
        let user = UserId::new("a");
        f.gateway.grab(&user, &coupon()).await.unwrap();
        let again = f.gateway.grab(&user, &coupon()).await.unwrap();
        assert_eq!(again.outcome, Outcome::Granted);
        assert_eq!(f.store.value(&coupon()), Some(3));
    }

    #[tokio::test]
    async fn unseeded_resource_is_not_a_denial() {
        let f = fixture(GatewayConfig::default(), 5);
        let err = f
            .gateway
            .grab(&UserId::new("a"), &ResourceId::new("other"))
            .await
            .unwrap_err();
        assert_eq!(err, GrabError::NotInitialized("other".to_string()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn store_outage_is_retryable_and_not_a_denial() {
        let f = fixture(GatewayConfig::default(), 5);
        f.store.set_unavailable(true);
        let err = f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap_err();
        assert!(matches!(err, GrabError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_store_yields_indeterminate() {
        let config = GatewayConfig {
            counter_timeout: Duration::from_millis(5),
            ..GatewayConfig::default()
        };
        let f = fixture(config, 5);
        f.store.set_latency(Some(Duration::from_millis(50)));
        let err = f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap_err();
        assert!(matches!(
            err,
            GrabError::Indeterminate {
                operation: "bounded_decrement",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn marker_failure_returns_the_unit() {
        let f = fixture(GatewayConfig::default(), 5);
        f.store.set_markers_unavailable(true);
        let err = f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.store.value(&coupon()), Some(5));
    }

    #[tokio::test]
    async fn padded_ids_name_the_same_user_and_resource() {
        let f = fixture(GatewayConfig::default(), 5);
        let first = f.gateway.grab(&UserId::new("alice"), &coupon()).await.unwrap();
        let second = f
            .gateway
            .grab(&UserId::new(" alice "), &ResourceId::new(" coupon\t"))
            .await
            .unwrap();

        assert_eq!(first.outcome, Outcome::Granted);
        assert_eq!(second.outcome, Outcome::Denied(DenialReason::Duplicate));
        assert_eq!(f.store.value(&coupon()), Some(4));
    }

    #[tokio::test]
    async fn lost_marker_reply_does_not_lock_the_user_out() {
        let f = fixture(GatewayConfig::default(), 5);
        let user = UserId::new("a");
        f.store.set_marker_replies_lost(true);
        let err = f.gateway.grab(&user, &coupon()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!f.store.has_marker(&coupon(), &user));
        assert_eq!(f.store.value(&coupon()), Some(5));

        f.store.set_marker_replies_lost(false);
        let retry = f.gateway.grab(&user, &coupon()).await.unwrap();
        assert_eq!(retry.outcome, Outcome::Granted);
        assert_eq!(f.store.value(&coupon()), Some(4));
    }

    #[tokio::test]
    async fn failed_attempt_keeps_the_marker_of_an_earlier_grant() {
        let f = fixture(GatewayConfig::default(), 5);
        let user = UserId::new("a");
        f.gateway.grab(&user, &coupon()).await.unwrap();

        f.store.set_marker_replies_lost(true);
        f.gateway.grab(&user, &coupon()).await.unwrap_err();
        assert!(f.store.has_marker(&coupon(), &user));
        assert_eq!(f.store.value(&coupon()), Some(4));
    }

    #[tokio::test]
    async fn open_breaker_skips_the_store() {
        let config = GatewayConfig {
            breaker: CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .open_timeout(Duration::from_secs(60))
                .build(),
            ..GatewayConfig::default()
        };
        let f = fixture(config, 5);
        f.store.set_unavailable(true);
        for _ in 0..2 {
            f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap_err();
        }
        f.store.set_unavailable(false);

        let err = f.gateway.grab(&UserId::new("a"), &coupon()).await.unwrap_err();
        assert_eq!(err, GrabError::Unavailable("circuit breaker open".to_string()));
        assert_eq!(f.store.decrement_calls(), 0);
    }

    #[tokio::test]
    async fn blank_like_is_rejected() {
        let f = fixture(GatewayConfig::default(), 0);
        assert!(matches!(
            f.gateway.like(&UserId::new("")),
            Err(GrabError::InvalidRequest(_))
        ));
        assert!(f.gateway.like(&UserId::new("u")).is_ok());
    }

    #[test]
    fn top_like_is_stable_and_about_one_in_ten() {
        let user = UserId::new("user-42");
        assert_eq!(is_top_like(&user), is_top_like(&user));

        let top = (0..10_000)
            .filter(|i| is_top_like(&UserId::new(format!("user-{i}"))))
            .count();
        assert!((700..1300).contains(&top), "top likes: {top}");
    }
}
