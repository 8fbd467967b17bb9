// =============================================================================
// Candle Relay — Main Entry Point
// =============================================================================
//
// Trade feed → candle aggregator → update coordinator → WebSocket subscribers,
// with closed candles written to the candle store on the side.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod market_data;
mod persistence;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broadcast::{SubscriberRegistry, UpdateCoordinator};
use crate::market_data::{CandleAggregator, FeedHandler};
use crate::persistence::{CandleStore, PersistenceGateway, SqliteCandleStore};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "relay_config.json";

/// How long shutdown waits for background tasks before giving up on them.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Candle Relay — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok());
    config.validate().context("invalid relay configuration")?;

    if config.api_key.is_empty() {
        warn!("No feed API key configured (FINNHUB_API_KEY) — the feed will likely refuse us");
    }
    info!(
        symbols = ?config.symbols,
        bucket_secs = config.bucket_secs,
        delivery_interval_ms = config.delivery_interval_ms,
        retention_mins = config.retention_mins,
        "Relay configured"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = Arc::new(
        SqliteCandleStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open candle store at {}", config.database_url))?,
    );
    let (gateway, persistence_task) = PersistenceGateway::spawn(store.clone());

    // ── 3. Pipeline components ───────────────────────────────────────────
    let aggregator = Arc::new(CandleAggregator::new(config.bucket_len(), &config.symbols));
    let registry = Arc::new(SubscriberRegistry::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Delivery loop ─────────────────────────────────────────────────
    let coordinator = UpdateCoordinator::new(registry.clone(), config.delivery_interval());
    let coordinator_task = tokio::spawn(coordinator.run(events_rx, shutdown_rx.clone()));

    // ── 5. Trade feed ────────────────────────────────────────────────────
    let handler = FeedHandler::new(
        aggregator.clone(),
        events_tx.clone(),
        gateway,
        config.retention(),
        config.prune_interval(),
    );
    let feed_task = tokio::spawn(market_data::run_trade_stream_with_reconnect(
        config.clone(),
        handler,
        shutdown_rx.clone(),
    ));
    info!(bucket_secs = aggregator.bucket_len().num_seconds(), "Trade feed launched");

    // ── 6. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        registry.clone(),
        aggregator.clone(),
        store,
        events_tx,
    ));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let app = api::rest::router(state);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while server_shutdown.changed().await.is_ok() {
                    if *server_shutdown.borrow() {
                        break;
                    }
                }
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    let closed = registry.close_all();
    info!(subscribers = closed, "Subscriber connections closed");

    // The feed task owns the last gateway handle; once it is gone the
    // persistence writer drains its queue and exits.
    for (name, task) in [
        ("trade feed", feed_task),
        ("update coordinator", coordinator_task),
        ("persistence writer", persistence_task),
        ("API server", server_task),
    ] {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task panicked during shutdown"),
            Err(_) => warn!(task = name, "Task did not stop in time"),
        }
    }

    info!("Candle Relay shut down complete.");
    Ok(())
}
