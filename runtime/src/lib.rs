//! # Flashgrab Runtime
//!
//! Services of the coupon pipeline, generic over the store and channel
//! contracts of `flashgrab-core`.
//!
//! ## Core Components
//!
//! - **Decision Gateway**: bounded decrement, duplicate marker, non-blocking event hand-off
//! - **Event Publisher**: bounded buffer draining into the event channel
//! - **Persister**: channel consumer writing idempotently to the ledger
//! - **Reconciler**: single-flight drift correction from the ledger
//! - **Query Service**: two-tier reads with a freshness window
//! - **Admin**: bootstrap, reset, on-demand reconcile
//!
//! ## Example
//!
//! ```ignore
//! use flashgrab_runtime::gateway::{DecisionGateway, GatewayConfig};
//! use flashgrab_runtime::publisher::{EventPublisher, PublisherConfig};
//!
//! let (publisher, _task) = EventPublisher::spawn(channel, PublisherConfig::new("flashgrab-events"), shutdown_rx);
//! let gateway = DecisionGateway::new(counter, publisher, clock, GatewayConfig::default());
//!
//! let response = gateway.grab(&UserId::new("u-1"), &ResourceId::new("coupon-101")).await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

/// Bounded publish buffer in front of the event channel
pub mod publisher;

/// Grab and like decisions
pub mod gateway;

/// Event channel to ledger consumer
pub mod persister;

/// Counter drift detection and correction
pub mod reconciler;

/// Two-tier read path
pub mod query;

/// Bootstrap, reset and on-demand reconcile
pub mod admin;

/// Request/response facade for the HTTP layer
pub mod api;

pub use admin::{Admin, AdminError};
pub use api::{ApiError, CouponApi};
pub use gateway::{DecisionGateway, GatewayConfig, GrabError, GrabResponse};
pub use persister::{Persister, PersisterConfig, PersistError};
pub use publisher::{EventPublisher, PublisherConfig};
pub use query::{QueryConfig, QueryError, QueryService};
pub use reconciler::{ReconcileError, ReconcileReport, Reconciler, ReconcilerConfig};
