// =============================================================================
// curve-tracker — Main Entry Point
// =============================================================================
//
// Real-time market-data tracker for short-lived bonding-curve tokens. Two
// venue WebSocket subscriptions feed a rolling trade buffer and per-token
// aggregators; a 1s driver runs the lifecycle machine and batches metric
// rows into Postgres.
//
// The health server starts before the store connection so orchestrator
// probes get answers immediately.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregate;
mod api;
mod buffer;
mod config;
mod core;
mod flush;
mod lifecycle;
mod metrics;
mod registry;
mod sync;
mod types;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::TrackerConfig;
use crate::core::{unix_now_secs, TrackerCore};
use crate::lifecycle::PhaseTable;
use crate::registry::RegistryClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("curve-tracker starting up");

    let config = TrackerConfig::load().context("fatal startup misconfiguration")?;
    info!(
        ws_uri = %config.ws_uri,
        refresh_interval_s = config.db_refresh_interval_secs,
        buffer_seconds = config.trade_buffer_seconds,
        connection_timeout_s = config.ws_connection_timeout_secs,
        whale_threshold = config.whale_threshold,
        "configuration loaded"
    );

    let health_port = config.health_port;
    let db_dsn = config.db_dsn.clone();
    let db_retry_delay = Duration::from_secs(config.db_retry_delay_secs);

    // ── 2. Build shared state ────────────────────────────────────────────
    let core = Arc::new(TrackerCore::new(config)?);

    // ── 3. Health server first ───────────────────────────────────────────
    let api_core = core.clone();
    tokio::spawn(async move {
        let app = api::router(api_core);
        let addr = format!("0.0.0.0:{health_port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("failed to bind the health server");
        info!(addr = %addr, "health server listening");
        axum::serve(listener, app)
            .await
            .expect("health server failed");
    });

    // ── 4. Registry connection with retry ────────────────────────────────
    // The tracker cannot schedule flushes without the phase table.
    let registry = loop {
        match RegistryClient::connect(&db_dsn).await {
            Ok(client) => match client.load_phases().await {
                Ok(phases) if !phases.is_empty() => {
                    *core.phases.write() = PhaseTable::new(phases);
                    core.set_db_connected(true);
                    break Arc::new(client);
                }
                Ok(_) => warn!("ref_coin_phases is empty; retrying"),
                Err(e) => {
                    core.metrics.db_errors.with_label_values(&["query"]).inc();
                    warn!(error = %e, "phase load failed; retrying");
                }
            },
            Err(e) => {
                core.set_db_connected(false);
                core.record_error("db_error", &e.to_string());
                core.metrics
                    .db_errors
                    .with_label_values(&["connection"])
                    .inc();
                warn!(error = %e, "registry connection failed; retrying");
            }
        }
        tokio::time::sleep(db_retry_delay).await;
    };

    // ── 5. Background tasks ──────────────────────────────────────────────
    // The trade task is the sole socket writer; the refresher and the
    // new-token listener hand it subscribe requests over this channel.
    let (subscribe_tx, subscribe_rx) = tokio::sync::mpsc::channel::<String>(1024);

    tokio::spawn(sync::run_registry_refresher(
        core.clone(),
        registry.clone(),
        subscribe_tx.clone(),
    ));

    tokio::spawn(flush::run_flush_driver(core.clone(), registry.clone()));

    // Buffer evictor: fixed 10s cadence.
    let evict_core = core.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let window = evict_core.config.read().trade_buffer_seconds;
            let removed = evict_core
                .buffer
                .evict_older_than(unix_now_secs() - window as f64);
            evict_core
                .metrics
                .trade_buffer_size
                .set(evict_core.buffer.total_len() as i64);
            if removed > 0 {
                debug!(removed, "rolling buffer eviction");
            }
        }
    });

    tokio::spawn(upstream::trade_stream::run_trade_client(
        core.clone(),
        registry.clone(),
        subscribe_rx,
        subscribe_tx,
    ));

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; draining final flush");
    flush::flush_once(&core, &registry).await;
    info!("curve-tracker shut down");
    Ok(())
}
