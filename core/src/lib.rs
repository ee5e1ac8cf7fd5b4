//! # Flashgrab Core
//!
//! Domain types and store contracts for the flashgrab coupon pipeline.
//!
//! A flash sale grants a strictly limited number of coupons to a burst of
//! concurrent requesters. This crate describes *what* flows through the
//! pipeline and *which* external stores it talks to; the behavior lives in
//! `flashgrab-runtime` and the adapters in `flashgrab-redis`,
//! `flashgrab-postgres` and `flashgrab-redpanda`.
//!
//! ## Data flow
//!
//! ```text
//! client ─▶ Gateway ─▶ CounterStore          (sync, bounded decrement)
//!              │
//!              └──────▶ EventChannel ─▶ Persister ─▶ Ledger ◀─ Reconciler
//!                                                                  │
//!                                          CounterStore ◀──────────┘
//! ```
//!
//! ## Contracts
//!
//! - [`counter_store::CounterStore`]: linearizable per-resource counter with a
//!   bounded decrement and duplicate-grant markers
//! - [`event_channel::EventChannel`]: at-least-once, manually acknowledged
//!   delivery
//! - [`ledger::Ledger`]: idempotent event history and aggregates
//! - [`dead_letter::DeadLetterQueue`]: parked undecodable messages
//! - [`stats_cache::StatsCache`]: expiring fast tier for reads
//!
//! Every contract returns boxed futures so implementations can be shared as
//! `Arc<dyn Trait>`.

pub use chrono::{DateTime, Utc};

pub mod counter_store;
pub mod dead_letter;
pub mod event;
pub mod event_channel;
pub mod ledger;
pub mod stats_cache;
pub mod types;

/// Injected dependencies that are not stores.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use flashgrab_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
