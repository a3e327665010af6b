// =============================================================================
// New-token listener — second venue subscription for token creation events
// =============================================================================
//
// Runs as a background task of the trade client with its own reconnect loop.
// Each previously unseen token address is marked early-subscribed and handed
// to the trade task over the subscribe channel, so its trades start flowing
// into the rolling buffer before the registry knows the token exists.
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::TrackerCore;
use crate::types::{parse_upstream, UpstreamMessage};
use crate::upstream::{read_next, retry_delay, subscribe_new_token_frame, ReadOutcome};

/// Reconnect loop for the new-token subscription. A failure here never tears
/// down the trade stream; the trade client aborts this task when its own
/// connection dies and respawns it on reconnect.
pub async fn run_new_token_listener(core: Arc<TrackerCore>, subscribe_tx: mpsc::Sender<String>) {
    let mut failures: u32 = 0;
    loop {
        match run_listener(&core, &subscribe_tx, &mut failures).await {
            Ok(()) => info!("new-token stream closed; reconnecting"),
            Err(e) => warn!(error = %e, "new-token stream failed"),
        }
        core.set_new_token_connected(false);

        failures = failures.saturating_add(1);
        let (base, max) = {
            let config = core.config.read();
            (config.ws_retry_delay_secs, config.ws_max_retry_delay_secs)
        };
        let delay = retry_delay(base, max, failures);
        info!(
            delay_secs = delay.as_secs_f64(),
            "new-token reconnect scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn run_listener(
    core: &Arc<TrackerCore>,
    subscribe_tx: &mpsc::Sender<String>,
    failures: &mut u32,
) -> Result<()> {
    let ws_uri = core.config.read().ws_uri.clone();

    info!(url = %ws_uri, "connecting to new-token WebSocket");
    let (ws, _response) = connect_async(&ws_uri)
        .await
        .context("failed to connect to the new-token WebSocket")?;
    let (mut sink, mut source) = ws.split();

    sink.send(Message::Text(subscribe_new_token_frame()))
        .await
        .context("failed to subscribe to new tokens")?;
    core.set_new_token_connected(true);
    *failures = 0;
    info!("new-token subscription active");

    loop {
        match read_next(&mut source).await? {
            ReadOutcome::IdleTimeout => continue,
            ReadOutcome::Closed => {
                warn!("new-token WebSocket stream ended");
                return Ok(());
            }
            ReadOutcome::Frame(Message::Text(text)) => {
                handle_new_token_frame(core, subscribe_tx, &text).await?;
            }
            ReadOutcome::Frame(_) => {}
        }
    }
}

async fn handle_new_token_frame(
    core: &TrackerCore,
    subscribe_tx: &mpsc::Sender<String>,
    text: &str,
) -> Result<()> {
    match parse_upstream(text) {
        Ok(UpstreamMessage::NewToken { mint }) => {
            // First sighting wins; re-announcements are ignored.
            if core.early_subscribed.write().insert(mint.clone()) {
                info!(mint = %mint, "new token; subscribing for the rolling buffer");
                subscribe_tx
                    .send(mint)
                    .await
                    .map_err(|_| anyhow!("subscribe channel closed"))?;
            }
        }
        Ok(UpstreamMessage::Trade(_)) | Ok(UpstreamMessage::Control) => {}
        Err(e) => {
            core.metrics.trades_malformed.inc();
            debug!(error = %e, "dropped malformed new-token frame");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
