//! Clash Subscription Converter Server
//!
//! Loads configuration, restores the subscription cache from its snapshot and
//! serves converted configurations over HTTP until interrupted.

use anyhow::Context;
use clash_subconvert::{
    AppConfig, CacheManager, ManagerOptions, RequestHandler, SubscriptionFetcher,
    SubscriptionServer,
};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with built-in defaults
/// clash-subconvert
///
/// # Start with a config file
/// clash-subconvert /path/to/clash_subconvert.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Clash Subscription Converter");

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            AppConfig::from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path))?
        }
        None => {
            info!("No configuration file given, using defaults");
            AppConfig::default()
        }
    };

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Snapshot path: {}", config.snapshot_path);
    info!("  - Default interval: {} minutes", config.default_interval_minutes);
    info!("  - Fetch timeout: {} seconds", config.fetch_timeout_secs);
    info!("  - Template: {}", config.template_path.as_deref().unwrap_or("built-in"));
    info!("  - Startup subscriptions: {}", config.subscriptions.len());

    let addr = config.listen_addr()?;
    let registry = Arc::new(config.build_registry()?);
    let fetcher = Arc::new(SubscriptionFetcher::with_timeout(config.fetch_timeout())?);

    let manager = Arc::new(
        CacheManager::start(
            registry,
            fetcher,
            ManagerOptions::default().with_snapshot_path(config.snapshot_path()),
        )
        .await,
    );
    info!("Restored {} subscriptions", manager.len());

    for sub in &config.subscriptions {
        if let Err(e) = manager.register(&sub.name, &sub.converter, &sub.url, sub.interval, None) {
            warn!("Skipping subscription {}: {}", sub.name, e);
        }
    }

    let handler = RequestHandler::new(Arc::clone(&manager))
        .with_default_interval(config.default_interval_minutes)
        .with_metrics_enabled(config.metrics_enabled);
    let server = SubscriptionServer::new(handler, addr);

    let shutdown = CancellationToken::new();
    let mut server_task = tokio::spawn(server.run(shutdown.clone()));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
            server_task.await
        }
        finished = &mut server_task => finished,
    };

    manager.shutdown().await;

    // A server that could not bind or crashed is fatal: exit non-zero
    match outcome {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Http server failed: {}", e);
            Err(e).context("http server failed")
        }
        Err(e) => {
            error!("Http server task panicked: {}", e);
            Err(e).context("http server task panicked")
        }
    }
}
