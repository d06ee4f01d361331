// =============================================================================
// Chart Feed Bridge — Main Entry Point
// =============================================================================
//
// Serves a charting front end with exchange market data: configuration,
// symbol search and resolution, paginated history, quote snapshots, and live
// bar / quote / depth streams multiplexed over shared exchange connections.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod datafeed;
mod error;
mod exchange;
mod feed_config;
mod market_data;
mod subscriptions;
mod types;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceStreams;
use crate::datafeed::Datafeed;
use crate::exchange::ExchangeRegistry;
use crate::feed_config::FeedConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Chart Feed Bridge starting up");

    let config_path =
        std::env::var("FEED_CONFIG").unwrap_or_else(|_| "feed_config.json".into());
    let mut config = FeedConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load feed config, using defaults");
        FeedConfig::default()
    });
    config.apply_env_overrides();

    // ── 2. Exchange registry ─────────────────────────────────────────────
    let mut registry = ExchangeRegistry::from_config(&config);
    binance::register(&mut registry, &config.exchanges);
    info!(exchanges = ?registry.ids(), "exchange factories registered");

    // ── 3. Stream transport & datafeed ───────────────────────────────────
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut streams = BinanceStreams::new(event_tx, Duration::from_secs(config.reconnect_delay_secs));
    if let Some(url) = &config.stream_base_url {
        info!(url = %url, "stream base URL overridden");
        streams = streams.with_base_url(url.as_str());
    }
    let streams = Arc::new(streams);
    let feed = Arc::new(Datafeed::new(Arc::new(registry), streams.clone(), &config));

    tokio::spawn(feed.clone().run_event_loop(event_rx));

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::router(feed.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    info!(
        open_connections = streams.open_connections(),
        "Chart Feed Bridge shut down complete"
    );
    Ok(())
}
