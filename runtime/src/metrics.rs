//! Prometheus metrics for the grab pipeline.
//!
//! Metrics are recorded through the `metrics` facade everywhere; nothing is
//! exported until [`MetricsServer::start`] installs the Prometheus recorder.
//! Without a recorder every macro call is a no-op, which is what the tests
//! rely on.
//!
//! # Example
//!
//! ```rust,no_run
//! use flashgrab_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use flashgrab_core::types::Outcome;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors that can occur while starting the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Invalid exporter configuration.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),

    /// The recorder or HTTP listener could not be installed.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Whether [`Self::start`] installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be configured or
    /// installed. A recorder that is already installed is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                register_metrics();
                self.started = true;
                tracing::info!(addr = %self.addr, "Metrics endpoint listening");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }
}

fn register_metrics() {
    describe_counter!("grab_requests_total", "Grab decisions by outcome and reason");
    describe_histogram!(
        "grab_duration_seconds",
        "Time from request to decision, excluding publish"
    );
    describe_counter!(
        "grab_infra_errors_total",
        "Grab requests answered with an infrastructure error"
    );
    describe_counter!(
        "grab_compensations_total",
        "Compensating increments issued after a decrement"
    );

    describe_counter!("publish_enqueued_total", "Events handed to the publish buffer");
    describe_counter!(
        "publish_failures_total",
        "Events that could not be handed to the publish buffer"
    );
    describe_counter!("publish_retries_total", "Broker publish retries");
    describe_gauge!("publish_buffer_depth", "Events waiting in the publish buffer");

    describe_counter!("persister_processed_total", "Events newly written to the ledger");
    describe_counter!(
        "persister_duplicates_total",
        "Redelivered events skipped by idempotency"
    );
    describe_counter!("persister_retries_total", "Ledger write retries");
    describe_counter!("persister_nacks_total", "Deliveries handed back to the channel");
    describe_counter!("persister_dead_lettered_total", "Deliveries parked in the DLQ");
    describe_histogram!("persister_batch_duration_seconds", "Ledger write time per batch");

    describe_counter!("reconcile_runs_total", "Reconcile passes by result");
    describe_counter!("reconcile_corrections_total", "Counter overwrites by the reconciler");
    describe_gauge!("reconcile_drift", "Last observed drift per resource");

    describe_counter!("query_tier_total", "Query answers by serving tier");

    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected while the circuit was open"
    );
}

/// Decision gateway metrics.
pub struct GrabMetrics;

impl GrabMetrics {
    /// Record one answered grab.
    pub fn record_decision(outcome: &Outcome, duration: Duration) {
        let reason = outcome.reason().map_or("none", |r| r.as_str());
        counter!("grab_requests_total", "outcome" => outcome.as_str(), "reason" => reason)
            .increment(1);
        histogram!("grab_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a grab that ended in an infrastructure error.
    pub fn record_infra_error(kind: &'static str) {
        counter!("grab_infra_errors_total", "kind" => kind).increment(1);
    }

    /// Record a compensating increment.
    pub fn record_compensation(succeeded: bool) {
        let result = if succeeded { "ok" } else { "failed" };
        counter!("grab_compensations_total", "result" => result).increment(1);
    }
}

/// Publish buffer metrics.
pub struct PublishMetrics;

impl PublishMetrics {
    /// An event entered the buffer.
    pub fn record_enqueued(depth: usize) {
        counter!("publish_enqueued_total").increment(1);
        Self::record_depth(depth);
    }

    /// An event could not enter the buffer.
    pub fn record_failure(reason: &'static str) {
        counter!("publish_failures_total", "reason" => reason).increment(1);
    }

    /// The publisher is retrying a broker publish.
    pub fn record_retry() {
        counter!("publish_retries_total").increment(1);
    }

    /// Current buffer depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_depth(depth: usize) {
        gauge!("publish_buffer_depth").set(depth as f64);
    }
}

/// Persister metrics.
pub struct PersisterMetrics;

impl PersisterMetrics {
    /// One batch was written.
    pub fn record_batch(applied: u64, duplicates: u64, duration: Duration) {
        counter!("persister_processed_total").increment(applied);
        counter!("persister_duplicates_total").increment(duplicates);
        histogram!("persister_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// A ledger write is being retried.
    pub fn record_retry() {
        counter!("persister_retries_total").increment(1);
    }

    /// Deliveries were nacked.
    pub fn record_nacks(count: u64) {
        counter!("persister_nacks_total").increment(count);
    }

    /// A delivery went to the DLQ.
    pub fn record_dead_letter() {
        counter!("persister_dead_lettered_total").increment(1);
    }
}

/// Reconciler metrics.
pub struct ReconcilerMetrics;

impl ReconcilerMetrics {
    /// One reconcile pass finished.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_run(resource: &str, drift: i64, corrected: bool) {
        let result = if corrected { "corrected" } else { "clean" };
        counter!("reconcile_runs_total", "result" => result).increment(1);
        gauge!("reconcile_drift", "resource" => resource.to_string()).set(drift as f64);
        if corrected {
            counter!("reconcile_corrections_total", "resource" => resource.to_string())
                .increment(1);
        }
    }
}

/// Query service metrics.
pub struct QueryMetrics;

impl QueryMetrics {
    /// A query was answered by `tier` (`counter`, `cache`, `ledger`).
    pub fn record_tier(query: &'static str, tier: &'static str) {
        counter!("query_tier_total", "query" => query, "tier" => tier).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashgrab_core::types::DenialReason;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        GrabMetrics::record_decision(
            &Outcome::Denied(DenialReason::OutOfStock),
            Duration::from_millis(1),
        );
        PublishMetrics::record_enqueued(3);
        PersisterMetrics::record_batch(2, 1, Duration::from_millis(4));
        ReconcilerMetrics::record_run("coupon-1", -2, true);
        QueryMetrics::record_tier("stock", "counter");
    }

    #[test]
    fn server_starts_unstarted() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap_or_else(|_| {
            SocketAddr::from(([127, 0, 0, 1], 0))
        }));
        assert!(!server.is_started());
    }
}
