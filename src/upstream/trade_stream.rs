// =============================================================================
// Trade stream client — owner of the trade socket and its subscriptions
// =============================================================================
//
// This task is the sole writer to the trade socket: subscribe requests from
// the new-token listener and the registry refresher arrive over a channel and
// are written here, so control frames never interleave.
//
// Runs forever; each connection attempt that fails backs off with
// `retry_delay` and the failure count resets once a connection subscribes
// successfully.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::{unix_now_secs, TrackerCore};
use crate::registry::RegistryClient;
use crate::sync;
use crate::types::{parse_upstream, UpstreamMessage};
use crate::upstream::{
    read_next, retry_delay, subscribe_token_trade_frame, token_stream, ReadOutcome, WsSink,
    WsSource,
};

/// Supervisor loop: connect, run, tear down, back off, repeat.
pub async fn run_trade_client(
    core: Arc<TrackerCore>,
    registry: Arc<RegistryClient>,
    mut subscribe_rx: mpsc::Receiver<String>,
    subscribe_tx: mpsc::Sender<String>,
) {
    let mut failures: u32 = 0;
    loop {
        let result = run_connection(
            &core,
            &registry,
            &mut subscribe_rx,
            &subscribe_tx,
            &mut failures,
        )
        .await;

        core.set_ws_connected(false);
        match result {
            Ok(()) => {
                core.record_error("ws_closed", "trade stream ended");
                info!("trade stream closed; reconnecting");
            }
            Err(e) => {
                core.record_error("ws_error", &e.to_string());
                warn!(error = %e, "trade stream failed");
            }
        }

        core.metrics.ws_reconnects.inc();
        failures = failures.saturating_add(1);
        core.status
            .reconnect_count
            .store(failures as u64, Ordering::Relaxed);

        let (base, max) = {
            let config = core.config.read();
            (config.ws_retry_delay_secs, config.ws_max_retry_delay_secs)
        };
        let delay = retry_delay(base, max, failures);
        info!(delay_secs = delay.as_secs_f64(), "trade stream reconnect scheduled");
        tokio::time::sleep(delay).await;
    }
}

/// One connection lifetime: connect, pre-subscribe the active set, supervise
/// the new-token listener, then pump frames until disconnect.
async fn run_connection(
    core: &Arc<TrackerCore>,
    registry: &Arc<RegistryClient>,
    subscribe_rx: &mut mpsc::Receiver<String>,
    subscribe_tx: &mpsc::Sender<String>,
    failures: &mut u32,
) -> Result<()> {
    let (ws_uri, ping_interval, ping_timeout, connection_timeout) = {
        let config = core.config.read();
        (
            config.ws_uri.clone(),
            Duration::from_secs(config.ws_ping_interval_secs),
            Duration::from_secs(config.ws_ping_timeout_secs),
            Duration::from_secs(config.ws_connection_timeout_secs),
        )
    };

    info!(url = %ws_uri, "connecting to trade WebSocket");
    let (ws, _response) = connect_async(&ws_uri)
        .await
        .context("failed to connect to the trade WebSocket")?;
    let (mut sink, mut source) = ws.split();
    core.set_ws_connected(true);
    info!("trade WebSocket connected");

    // Pre-subscription: fold the current active set into the watchlist and
    // subscribe every tracked address on this fresh socket in one frame.
    match registry.fetch_active().await {
        Ok(active) => {
            core.set_db_connected(true);
            sync::apply_active_set(core, active, unix_now_secs());

            let keys: Vec<String> = core.watchlist.read().keys().cloned().collect();
            {
                let mut early = core.early_subscribed.write();
                for key in &keys {
                    early.insert(key.clone());
                }
            }
            if !keys.is_empty() {
                sink.send(Message::Text(subscribe_token_trade_frame(&keys)))
                    .await
                    .context("failed to send the bulk trade subscription")?;
                info!(count = keys.len(), "bulk trade subscription sent");
            }
        }
        Err(e) => {
            core.set_db_connected(false);
            warn!(error = %e, "pre-subscription fetch failed; continuing without it");
        }
    }

    *failures = 0;
    core.status.reconnect_count.store(0, Ordering::Relaxed);

    // The listener lives only as long as this connection; it owns its own
    // reconnect loop for the new-token socket in the meantime.
    let listener = tokio::spawn(token_stream::run_new_token_listener(
        core.clone(),
        subscribe_tx.clone(),
    ));

    let result = read_loop(
        core,
        &mut sink,
        &mut source,
        subscribe_rx,
        ping_interval,
        ping_timeout,
        connection_timeout,
    )
    .await;

    listener.abort();
    core.set_new_token_connected(false);
    result
}

async fn read_loop(
    core: &TrackerCore,
    sink: &mut WsSink,
    source: &mut WsSource,
    subscribe_rx: &mut mpsc::Receiver<String>,
    ping_interval: Duration,
    ping_timeout: Duration,
    connection_timeout: Duration,
) -> Result<()> {
    let mut last_message = Instant::now();
    let mut last_ping = Instant::now();
    // Deadline of an outstanding ping; cleared by the matching pong. A pong
    // missing past `ping_timeout` detects a dead link faster than the
    // general idle timeout.
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        // Drain pending subscribe requests before the next read.
        while let Ok(mint) = subscribe_rx.try_recv() {
            sink.send(Message::Text(subscribe_token_trade_frame(
                std::slice::from_ref(&mint),
            )))
            .await
            .context("failed to send a trade subscription")?;
            debug!(mint = %mint, "trade subscription sent");
        }

        if awaiting_pong.is_none() && last_ping.elapsed() >= ping_interval {
            sink.send(Message::Ping(Vec::new()))
                .await
                .context("failed to send ping")?;
            last_ping = Instant::now();
            awaiting_pong = Some(last_ping);
        }
        if let Some(sent) = awaiting_pong {
            if sent.elapsed() > ping_timeout {
                anyhow::bail!(
                    "no pong within {}s; forcing reconnect",
                    ping_timeout.as_secs()
                );
            }
        }

        match read_next(source).await? {
            ReadOutcome::IdleTimeout => {
                if last_message.elapsed() > connection_timeout {
                    anyhow::bail!(
                        "no messages for {}s; forcing reconnect",
                        connection_timeout.as_secs()
                    );
                }
            }
            ReadOutcome::Closed => {
                warn!("trade WebSocket stream ended");
                return Ok(());
            }
            ReadOutcome::Frame(Message::Text(text)) => {
                last_message = Instant::now();
                core.mark_message_received();
                handle_frame(core, &text);
            }
            ReadOutcome::Frame(Message::Pong(_)) => {
                last_message = Instant::now();
                awaiting_pong = None;
            }
            ReadOutcome::Frame(_) => {
                // Other non-text frames only refresh liveness.
                last_message = Instant::now();
            }
        }
    }
}

/// Classify one text frame and route it: every parsed trade goes to the
/// rolling buffer exactly once, tracked tokens also hit their aggregator.
fn handle_frame(core: &TrackerCore, text: &str) {
    match parse_upstream(text) {
        Ok(UpstreamMessage::Trade(trade)) => {
            core.metrics.trades_received.inc();
            let now_ts = unix_now_secs();
            core.buffer_trade(trade.clone(), now_ts);

            if core.process_trade(&trade) {
                core.metrics.trades_processed.inc();
                core.metrics.last_trade_timestamp.set(now_ts);
                let total = core.total_trades.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 100 == 0 {
                    info!(
                        total,
                        tracked = core.watchlist.read().len(),
                        "trades processed"
                    );
                }
            }
        }
        Ok(UpstreamMessage::NewToken { .. }) | Ok(UpstreamMessage::Control) => {}
        Err(e) => {
            core.metrics.trades_malformed.inc();
            debug!(error = %e, "dropped malformed frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
