// =============================================================================
// Registry refresher — reconciles the in-memory tracked set with the store
// =============================================================================
//
// Every refresh computes the set difference between the registry's active set
// and the watchlist. Additions get an aggregator, a subscribe request, and a
// retroactive replay of buffered trades; removals are dropped locally (the
// registry already deactivated them). A failed refresh leaves the watchlist
// untouched and is retried on the next cadence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{unix_now_secs, TrackedToken, TrackerCore};
use crate::registry::RegistryClient;
use crate::types::ActiveTokenRecord;

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Addresses that still need a trade subscription on the socket.
    pub to_subscribe: Vec<String>,
    pub replayed_trades: u64,
}

/// Fold a freshly fetched active set into the core state.
///
/// Callers fetch first, then apply; the reconciliation itself touches no
/// store.
pub fn apply_active_set(
    core: &TrackerCore,
    active: HashMap<String, ActiveTokenRecord>,
    now_ts: f64,
) -> SyncOutcome {
    let (buffer_seconds, whale_threshold) = {
        let config = core.config.read();
        (config.trade_buffer_seconds, config.whale_threshold)
    };

    let mut outcome = SyncOutcome::default();
    let mut watchlist = core.watchlist.write();

    // Removals: the registry no longer lists them as active.
    let stale: Vec<String> = watchlist
        .keys()
        .filter(|mint| !active.contains_key(*mint))
        .cloned()
        .collect();
    for mint in stale {
        watchlist.remove(&mint);
        outcome.removed.push(mint);
    }

    // Additions: initialize the aggregator, request a subscription, and fold
    // in any trades the buffer already holds.
    for (mint, meta) in active {
        if watchlist.contains_key(&mint) {
            continue;
        }

        let interval_seconds = {
            let phases = core.phases.read();
            match phases.resolve(meta.phase_id) {
                Some(phase) => phase.interval_seconds,
                None => {
                    warn!(mint = %mint, phase_id = meta.phase_id, "no phase config; skipping token");
                    continue;
                }
            }
        };

        if core.early_subscribed.write().insert(mint.clone()) {
            outcome.to_subscribe.push(mint.clone());
        }

        let mut entry = TrackedToken::new(meta, interval_seconds, now_ts);
        debug!(
            mint = %mint,
            phase_id = entry.meta.phase_id,
            started_at = %entry.meta.started_at,
            "token activated"
        );

        let created_ts = entry.meta.created_at.timestamp_millis() as f64 / 1000.0;
        let from_ts = created_ts.max(now_ts - buffer_seconds as f64);
        let missed = core.buffer.replay(&mint, from_ts, now_ts);
        if !missed.is_empty() {
            let creator = entry.meta.creator_address.clone();
            for trade in &missed {
                entry.window.apply(trade, &creator, whale_threshold);
            }
            core.metrics.trades_from_buffer.inc_by(missed.len() as u64);
            outcome.replayed_trades += missed.len() as u64;
        }

        watchlist.insert(mint.clone(), entry);
        outcome.added.push(mint);
    }

    core.metrics.coins_tracked.set(watchlist.len() as i64);
    outcome
}

/// Periodic refresh task.
pub async fn run_registry_refresher(
    core: Arc<TrackerCore>,
    registry: Arc<RegistryClient>,
    subscribe_tx: mpsc::Sender<String>,
) {
    loop {
        let refresh_secs = core.config.read().db_refresh_interval_secs;
        tokio::time::sleep(Duration::from_secs(refresh_secs)).await;

        registry.repair_missing_streams().await;

        let started = Instant::now();
        match registry.fetch_active().await {
            Ok(active) => {
                core.metrics
                    .db_query_duration
                    .observe(started.elapsed().as_secs_f64());
                core.set_db_connected(true);

                let outcome = apply_active_set(&core, active, unix_now_secs());
                for mint in &outcome.to_subscribe {
                    if subscribe_tx.send(mint.clone()).await.is_err() {
                        warn!("subscribe channel closed; trade client is gone");
                        return;
                    }
                }

                if !outcome.added.is_empty() || !outcome.removed.is_empty() {
                    info!(
                        added = outcome.added.len(),
                        removed = outcome.removed.len(),
                        replayed = outcome.replayed_trades,
                        tracked = core.watchlist.read().len(),
                        "active set reconciled"
                    );
                }
            }
            Err(e) => {
                core.set_db_connected(false);
                core.record_error("db_error", &e.to_string());
                core.metrics.db_errors.with_label_values(&["query"]).inc();
                warn!(error = %e, "active-set refresh failed; retrying next cadence");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::lifecycle::{PhaseConfig, PhaseTable};
    use crate::types::{TradeEvent, TradeKind};
    use chrono::{Duration as ChronoDuration, Utc};

    fn test_core() -> TrackerCore {
        let core = TrackerCore::new(TrackerConfig::default()).unwrap();
        *core.phases.write() = PhaseTable::new(vec![PhaseConfig {
            id: 1,
            name: "phase_1".into(),
            interval_seconds: 5,
            max_age_minutes: 10,
        }]);
        core
    }

    fn record(phase_id: i32, created_secs_ago: i64) -> ActiveTokenRecord {
        let created = Utc::now() - ChronoDuration::seconds(created_secs_ago);
        ActiveTokenRecord {
            phase_id,
            created_at: created,
            started_at: created,
            creator_address: "Creator".into(),
        }
    }

    fn sample_trade(mint: &str, sol: f64) -> TradeEvent {
        TradeEvent {
            mint: mint.into(),
            trader: "Trader".into(),
            kind: TradeKind::Buy,
            sol_amount: sol,
            v_sol_reserves: 30.0,
            v_token_reserves: 1_000_000_000.0,
        }
    }

    #[test]
    fn activation_replays_buffered_trades_in_order() {
        let core = test_core();
        let now = unix_now_secs();

        // New-token listener saw the mint first; four trades land in the
        // buffer over 20 seconds before the registry activates it.
        core.early_subscribed.write().insert("T".into());
        for (i, sol) in [0.1, 0.2, 0.3, 0.4].iter().enumerate() {
            let mut trade = sample_trade("T", *sol);
            trade.v_sol_reserves = 30.0 + i as f64;
            core.buffer.append(trade, now - 20.0 + i as f64 * 5.0);
        }

        let mut active = HashMap::new();
        active.insert("T".to_string(), record(1, 25));
        let outcome = apply_active_set(&core, active, now);

        assert_eq!(outcome.added, vec!["T".to_string()]);
        assert_eq!(outcome.replayed_trades, 4);
        // Already early-subscribed, so no new subscribe request.
        assert!(outcome.to_subscribe.is_empty());
        assert_eq!(core.metrics.trades_from_buffer.get(), 4);

        let watchlist = core.watchlist.read();
        let entry = watchlist.get("T").unwrap();
        assert_eq!(entry.window.num_buys, 4);
        assert!((entry.window.total_vol - 1.0).abs() < 1e-9);
        // Chronological replay: close carries the last trade's price.
        assert!((entry.window.close - 33.0 / 1_000_000_000.0).abs() < 1e-15);
        assert!((entry.next_flush - (now + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn activation_without_early_subscription_requests_subscribe() {
        let core = test_core();
        let mut active = HashMap::new();
        active.insert("T".to_string(), record(1, 5));

        let outcome = apply_active_set(&core, active, unix_now_secs());
        assert_eq!(outcome.to_subscribe, vec!["T".to_string()]);
        assert!(core.early_subscribed.read().contains("T"));
    }

    #[test]
    fn replay_respects_creation_cutoff() {
        let core = test_core();
        let now = unix_now_secs();

        // One trade buffered before the token even existed; one after.
        core.buffer.append(sample_trade("T", 9.0), now - 100.0);
        core.buffer.append(sample_trade("T", 0.5), now - 10.0);

        let mut active = HashMap::new();
        active.insert("T".to_string(), record(1, 30));
        let outcome = apply_active_set(&core, active, now);

        assert_eq!(outcome.replayed_trades, 1);
        let watchlist = core.watchlist.read();
        assert!((watchlist.get("T").unwrap().window.total_vol - 0.5).abs() < 1e-9);
    }

    #[test]
    fn resubmitting_same_active_set_is_idempotent() {
        let core = test_core();
        let mut active = HashMap::new();
        active.insert("A".to_string(), record(1, 5));
        active.insert("B".to_string(), record(1, 5));

        let first = apply_active_set(&core, active.clone(), unix_now_secs());
        assert_eq!(first.added.len(), 2);
        assert_eq!(first.to_subscribe.len(), 2);

        let second = apply_active_set(&core, active, unix_now_secs());
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert!(second.to_subscribe.is_empty());
        assert_eq!(core.watchlist.read().len(), 2);
    }

    #[test]
    fn deactivated_tokens_are_dropped_locally() {
        let core = test_core();
        let mut active = HashMap::new();
        active.insert("A".to_string(), record(1, 5));
        active.insert("B".to_string(), record(1, 5));
        apply_active_set(&core, active, unix_now_secs());

        let mut shrunk = HashMap::new();
        shrunk.insert("A".to_string(), record(1, 5));
        let outcome = apply_active_set(&core, shrunk, unix_now_secs());

        assert_eq!(outcome.removed, vec!["B".to_string()]);
        assert!(!core.watchlist.read().contains_key("B"));
        assert_eq!(core.metrics.coins_tracked.get(), 1);
    }

    #[test]
    fn unknown_phase_falls_back_to_first_real_phase() {
        let core = test_core();
        let mut active = HashMap::new();
        active.insert("T".to_string(), record(42, 5));

        apply_active_set(&core, active, unix_now_secs());
        let watchlist = core.watchlist.read();
        assert_eq!(watchlist.get("T").unwrap().interval_seconds, 5);
    }
}
