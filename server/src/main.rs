//! flashgrab worker.
//!
//! Runs the decision gateway, persister, reconciler and query services until
//! SIGINT or SIGTERM, then drains the publish buffer and stops.

use anyhow::Context;
use flashgrab_runtime::metrics::MetricsServer;
use flashgrab_server::{App, Config};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            eprintln!("Ignoring unreadable .env file: {error}");
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flashgrab=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting flashgrab worker");

    let config = Config::from_env();
    info!(
        redis_url = %config.redis.url,
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        resources = config.resources.len(),
        duplicate_protection = config.gateway.duplicate_protection,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr());
    match metrics.start() {
        Ok(()) => info!(addr = %config.metrics_addr(), "Metrics endpoint listening"),
        Err(error) => warn!(%error, "Metrics endpoint disabled"),
    }

    let app = App::build(&config)
        .await
        .context("failed to start the worker")?;

    shutdown_signal().await;

    app.shutdown(Duration::from_secs(config.shutdown_timeout)).await;
    info!("flashgrab worker stopped");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for Ctrl+C (SIGINT) or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
