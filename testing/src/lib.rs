//! # Flashgrab Testing
//!
//! In-memory fakes and helpers for testing the flashgrab pipeline without
//! Redis, Postgres or a broker.
//!
//! This crate provides:
//! - [`InMemoryCounterStore`]: bounded-decrement counter with fault injection
//! - [`InMemoryEventChannel`]: at-least-once channel with nack redelivery
//! - [`InMemoryLedger`] and [`InMemoryDeadLetterQueue`]: idempotent ledger
//! - [`InMemoryStatsCache`]: cache that records the TTL of every write
//! - [`FixedClock`]: deterministic, manually advanced time
//!
//! ## Example
//!
//! ```ignore
//! use flashgrab_testing::{InMemoryCounterStore, InMemoryEventChannel, InMemoryLedger};
//!
//! #[tokio::test]
//! async fn three_coupons() {
//!     let ledger = InMemoryLedger::with_stock(&[("coupon-101", 3)]);
//!     let counters = InMemoryCounterStore::new();
//!     let channel = InMemoryEventChannel::new();
//!     // build a gateway and a persister over the fakes ...
//! }
//! ```

use chrono::{DateTime, Utc};
use flashgrab_core::environment::Clock;

pub mod counter_store;
pub mod event_channel;
pub mod ledger;
pub mod stats_cache;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`FixedClock::advance`] moves it. Clones
    /// share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use flashgrab_testing::mocks::FixedClock;
    /// use flashgrab_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2);
    ///
    /// clock.advance(chrono::Duration::seconds(5));
    /// assert_eq!(clock.now() - time1, chrono::Duration::seconds(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if the clock mutex is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a compact `tracing` subscriber for test output.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Stock between 0 and `max_stock` and a request count between 1 and
    /// `max_requests`.
    pub fn stock_and_requests(
        max_stock: i64,
        max_requests: usize,
    ) -> impl Strategy<Value = (i64, usize)> {
        (0..=max_stock, 1..=max_requests)
    }

    /// Non-blank user id.
    pub fn user_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,12}"
    }
}

// Re-export commonly used items
pub use counter_store::InMemoryCounterStore;
pub use event_channel::InMemoryEventChannel;
pub use ledger::{InMemoryDeadLetterQueue, InMemoryLedger, LikeTotals};
pub use mocks::{FixedClock, test_clock};
pub use stats_cache::InMemoryStatsCache;
