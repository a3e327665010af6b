// =============================================================================
// Flush engine — 1s driver for lifecycle evaluation and batched metric writes
// =============================================================================
//
// Each tick walks the watchlist once: graduation, then promotion, then the
// flush decision per token. In-memory mutations happen under the watchlist
// lock; all database writes happen after it is released. The metric batch is
// per tick, so write amplification scales with ticks, not tokens.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::aggregate::{MetricRow, WindowStats};
use crate::core::{unix_now_secs, TrackerCore};
use crate::lifecycle::{evaluate, LifecycleDecision};
use crate::registry::RegistryClient;

/// A pending `current_phase_id` update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseWrite {
    pub mint: String,
    pub from: i32,
    pub to: i32,
}

/// A pending terminal lifecycle write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalWrite {
    pub mint: String,
    pub graduated: bool,
}

/// Everything one tick produced for the database.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub rows: Vec<MetricRow>,
    pub phase_writes: Vec<PhaseWrite>,
    pub terminal_writes: Vec<TerminalWrite>,
}

/// Run one lifecycle/flush pass over the watchlist, applying all in-memory
/// transitions and returning the database work.
pub fn collect_tick(
    core: &TrackerCore,
    now_ts: f64,
    now_utc: DateTime<Utc>,
) -> TickOutcome {
    let (sol_reserves_full, age_offset_min) = {
        let config = core.config.read();
        (config.sol_reserves_full, config.age_offset_min)
    };
    let phases = core.phases.read().clone();

    let mut outcome = TickOutcome::default();
    let mut terminal: Vec<(String, bool)> = Vec::new();

    let mut watchlist = core.watchlist.write();
    for (mint, entry) in watchlist.iter_mut() {
        let bonding_pct = entry.window.bonding_curve_pct(sol_reserves_full);
        match evaluate(
            &phases,
            entry.meta.phase_id,
            entry.meta.created_at,
            now_utc,
            bonding_pct,
            age_offset_min,
        ) {
            LifecycleDecision::Graduate => {
                terminal.push((mint.clone(), true));
                continue;
            }
            LifecycleDecision::Finish => {
                terminal.push((mint.clone(), false));
                continue;
            }
            LifecycleDecision::Promote {
                next_id,
                interval_seconds,
            } => {
                outcome.phase_writes.push(PhaseWrite {
                    mint: mint.clone(),
                    from: entry.meta.phase_id,
                    to: next_id,
                });
                entry.meta.phase_id = next_id;
                entry.interval_seconds = interval_seconds;
                entry.next_flush = now_ts + interval_seconds as f64;
                core.metrics.phase_switches.inc();
            }
            LifecycleDecision::Keep => {}
        }

        if now_ts >= entry.next_flush {
            if let Some(row) = entry.window.finish(
                mint,
                now_utc,
                entry.meta.phase_id,
                sol_reserves_full,
            ) {
                outcome.rows.push(row);
            }
            entry.window = WindowStats::new();
            entry.next_flush = now_ts + entry.interval_seconds as f64;
        }
    }

    // Terminal tokens leave the tracked set; their partial window is dropped.
    for (mint, graduated) in terminal {
        watchlist.remove(&mint);
        if graduated {
            core.metrics.coins_graduated.inc();
        } else {
            core.metrics.coins_finished.inc();
        }
        outcome.terminal_writes.push(TerminalWrite { mint, graduated });
    }
    core.metrics.coins_tracked.set(watchlist.len() as i64);

    outcome
}

/// Apply one tick's database work: phase updates, the bulk metric insert,
/// then terminal writes. A failed batch is dropped whole and counted.
pub async fn write_outcome(
    core: &TrackerCore,
    registry: &RegistryClient,
    outcome: TickOutcome,
) {
    for pw in &outcome.phase_writes {
        info!(mint = %pw.mint, from = pw.from, to = pw.to, "phase promotion");
        if let Err(e) = registry.set_phase(&pw.mint, pw.to).await {
            core.set_db_connected(false);
            core.record_error("db_error", &e.to_string());
            core.metrics.db_errors.with_label_values(&["update"]).inc();
            warn!(mint = %pw.mint, error = %e, "phase switch write failed");
        }
    }

    if !outcome.rows.is_empty() {
        let count = outcome.rows.len() as u64;
        let started = Instant::now();
        match registry.insert_metrics(&outcome.rows).await {
            Ok(()) => {
                core.metrics
                    .flush_duration
                    .observe(started.elapsed().as_secs_f64());
                core.metrics.metrics_saved.inc_by(count);
                core.total_metrics_saved.fetch_add(count, Ordering::Relaxed);
                core.set_db_connected(true);
                info!(rows = count, "metric batch saved");
            }
            Err(e) => {
                core.metrics.metrics_lost.inc_by(count);
                core.metrics.db_errors.with_label_values(&["insert"]).inc();
                core.set_db_connected(false);
                core.record_error("db_error", &e.to_string());
                warn!(rows = count, error = %e, "metric batch dropped");
            }
        }
    }

    for tw in &outcome.terminal_writes {
        if tw.graduated {
            info!(mint = %tw.mint, "graduation: token left the venue");
        } else {
            info!(mint = %tw.mint, "lifecycle finished");
        }
        if let Err(e) = registry.end_stream(&tw.mint, tw.graduated).await {
            core.set_db_connected(false);
            core.record_error("db_error", &e.to_string());
            core.metrics.db_errors.with_label_values(&["update"]).inc();
            warn!(mint = %tw.mint, error = %e, "terminal write failed");
        }
    }
}

/// One complete pass: collect, then write. Also used for the shutdown drain.
pub async fn flush_once(core: &TrackerCore, registry: &RegistryClient) {
    let outcome = collect_tick(core, unix_now_secs(), Utc::now());
    write_outcome(core, registry, outcome).await;
}

/// Wall-clock driver; wakes every second.
pub async fn run_flush_driver(core: Arc<TrackerCore>, registry: Arc<RegistryClient>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        flush_once(&core, &registry).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::core::TrackedToken;
    use crate::lifecycle::{PhaseConfig, PhaseTable};
    use crate::types::{ActiveTokenRecord, TradeEvent, TradeKind};
    use chrono::Duration as ChronoDuration;

    fn test_core() -> TrackerCore {
        let core = TrackerCore::new(TrackerConfig::default()).unwrap();
        *core.phases.write() = PhaseTable::new(vec![
            PhaseConfig {
                id: 1,
                name: "phase_1".into(),
                interval_seconds: 5,
                max_age_minutes: 10,
            },
            PhaseConfig {
                id: 2,
                name: "phase_2".into(),
                interval_seconds: 30,
                max_age_minutes: 60,
            },
        ]);
        core
    }

    fn tracked(phase_id: i32, created_mins_ago: i64, now_ts: f64) -> TrackedToken {
        let created = Utc::now() - ChronoDuration::minutes(created_mins_ago);
        TrackedToken::new(
            ActiveTokenRecord {
                phase_id,
                created_at: created,
                started_at: created,
                creator_address: "Creator".into(),
            },
            5,
            now_ts,
        )
    }

    fn trade(sol: f64, v_sol: f64) -> TradeEvent {
        TradeEvent {
            mint: "T".into(),
            trader: "Trader".into(),
            kind: TradeKind::Buy,
            sol_amount: sol,
            v_sol_reserves: v_sol,
            v_token_reserves: 1_000_000_000.0,
        }
    }

    #[test]
    fn due_window_flushes_and_reschedules() {
        let core = test_core();
        let now_ts = unix_now_secs();
        let mut entry = tracked(1, 1, now_ts - 10.0);
        entry.window.apply(&trade(0.5, 30.0), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].token_address, "T");
        assert!(outcome.terminal_writes.is_empty());

        let watchlist = core.watchlist.read();
        let entry = watchlist.get("T").unwrap();
        assert!(entry.window.is_empty());
        assert!((entry.next_flush - (now_ts + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_window_flush_emits_no_row() {
        let core = test_core();
        let now_ts = unix_now_secs();
        core.watchlist
            .write()
            .insert("T".into(), tracked(1, 1, now_ts - 10.0));

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert!(outcome.rows.is_empty());

        // Still rescheduled.
        let watchlist = core.watchlist.read();
        assert!((watchlist.get("T").unwrap().next_flush - (now_ts + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn undue_window_is_untouched() {
        let core = test_core();
        let now_ts = unix_now_secs();
        let mut entry = tracked(1, 1, now_ts);
        entry.window.apply(&trade(0.5, 30.0), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert!(outcome.rows.is_empty());
        assert!(!core.watchlist.read().get("T").unwrap().window.is_empty());
    }

    #[test]
    fn graduation_removes_token_without_partial_row() {
        let core = test_core();
        let now_ts = unix_now_secs();
        // Flush overdue AND graduated: the terminal transition wins.
        let mut entry = tracked(1, 1, now_ts - 10.0);
        entry.window.apply(&trade(0.5, 84.6), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert!(outcome.rows.is_empty());
        assert_eq!(
            outcome.terminal_writes,
            vec![TerminalWrite {
                mint: "T".into(),
                graduated: true
            }]
        );
        assert!(core.watchlist.read().is_empty());
        assert_eq!(core.metrics.coins_graduated.get(), 1);

        // The token is gone, so no second terminal write can ever happen.
        let again = collect_tick(&core, now_ts + 1.0, Utc::now());
        assert!(again.terminal_writes.is_empty());
    }

    #[test]
    fn promotion_updates_interval_and_schedule() {
        let core = test_core();
        let now_ts = unix_now_secs();
        // Created 75 min ago, offset 60 => effective age 15 min > 10 min cap.
        let mut entry = tracked(1, 75, now_ts - 100.0);
        entry.window.apply(&trade(0.5, 30.0), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert_eq!(
            outcome.phase_writes,
            vec![PhaseWrite {
                mint: "T".into(),
                from: 1,
                to: 2
            }]
        );
        assert!(outcome.terminal_writes.is_empty());
        // The reschedule means the overdue flush does not fire this tick.
        assert!(outcome.rows.is_empty());

        let watchlist = core.watchlist.read();
        let entry = watchlist.get("T").unwrap();
        assert_eq!(entry.meta.phase_id, 2);
        assert_eq!(entry.interval_seconds, 30);
        assert!((entry.next_flush - (now_ts + 30.0)).abs() < 1e-9);
        assert_eq!(core.metrics.phase_switches.get(), 1);
    }

    #[test]
    fn aged_out_of_last_phase_finishes() {
        let core = test_core();
        let now_ts = unix_now_secs();
        let mut entry = tracked(2, 60 + 61, now_ts);
        entry.window.apply(&trade(0.5, 30.0), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        let outcome = collect_tick(&core, now_ts, Utc::now());
        assert_eq!(
            outcome.terminal_writes,
            vec![TerminalWrite {
                mint: "T".into(),
                graduated: false
            }]
        );
        assert!(core.watchlist.read().is_empty());
        assert_eq!(core.metrics.coins_finished.get(), 1);
    }

    #[test]
    fn flushed_row_carries_promoted_phase_id() {
        let core = test_core();
        let now_ts = unix_now_secs();
        let mut entry = tracked(1, 75, now_ts - 100.0);
        entry.window.apply(&trade(0.5, 30.0), "", 1.0);
        core.watchlist.write().insert("T".into(), entry);

        // First tick promotes; second tick (30s later) flushes as phase 2.
        collect_tick(&core, now_ts, Utc::now());
        let later = collect_tick(&core, now_ts + 30.0, Utc::now());
        assert_eq!(later.rows.len(), 1);
        assert_eq!(later.rows[0].phase_id, 2);
    }
}
