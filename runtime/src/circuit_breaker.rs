//! Circuit breaker around counter store calls.
//!
//! When the counter store keeps failing, every grab would otherwise wait for
//! its own timeout before failing. The breaker opens after a run of
//! consecutive failures and rejects calls immediately until a cool-down has
//! passed; then it lets single probe calls through until enough of them
//! succeed.
//!
//! # States
//!
//! - **Closed**: calls pass; consecutive failures are counted.
//! - **Open**: calls are rejected without touching the store.
//! - **`HalfOpen`**: one probe at a time is let through.
//!
//! # Example
//!
//! ```rust
//! use flashgrab_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "counter_store",
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .open_timeout(Duration::from_secs(2))
//!         .build(),
//! );
//!
//! let value = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert!(value.is_ok());
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Time spent open before probes are allowed
    pub open_timeout: Duration,
    /// Successful probes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            open_timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    open_timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn open_timeout(mut self, duration: Duration) -> Self {
        self.open_timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5).max(1),
            open_timeout: self.open_timeout.unwrap_or(Duration::from_secs(2)),
            success_threshold: self.success_threshold.unwrap_or(2).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// Probing for recovery
    HalfOpen,
}

impl State {
    const fn gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Rejected without calling the operation
    #[error("Circuit breaker is open")]
    Open,
    /// The operation ran and failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

/// Counters exposed for tests and status pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted
    pub total_calls: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
    /// Calls that ran and failed
    pub total_failures: u64,
}

/// Shared circuit breaker. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker. `name` labels its logs and metrics.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_started: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] without running the operation
    /// when the circuit is open, or [`CircuitBreakerError::Inner`] when the
    /// operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.try_acquire() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name)
                .increment(1);
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Counters since creation.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, State::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is a handful of counters; a panic elsewhere cannot leave it invalid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => true,
            State::HalfOpen => {
                // A probe whose caller went away must not wedge the breaker.
                let busy = inner
                    .probe_started
                    .is_some_and(|at| at.elapsed() < self.config.open_timeout);
                if !busy {
                    inner.probe_started = Some(Instant::now());
                }
                !busy
            }
            State::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_timeout);
                if expired {
                    self.transition(&mut inner, State::HalfOpen);
                    inner.success_count = 0;
                    inner.probe_started = Some(Instant::now());
                }
                expired
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => inner.failure_count = 0,
            State::HalfOpen => {
                inner.probe_started = None;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, State::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
            State::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, State::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.probe_started = None;
                self.transition(&mut inner, State::Open);
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            State::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        if inner.state == to {
            return;
        }
        tracing::warn!(
            breaker = self.name,
            from = ?inner.state,
            to = ?to,
            failures = inner.failure_count,
            "Circuit breaker state change"
        );
        inner.state = to;
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name).set(to.gauge());
    }
}
