// =============================================================================
// Central tracker state — shared across all async tasks via Arc<TrackerCore>
// =============================================================================
//
// The single source of truth for the process. HTTP handlers, the stream
// readers, the registry refresher, and the flush driver all hold Arc
// references to this value; there are no process-level globals.
//
// Thread safety:
//   - Atomics for connection flags and totals.
//   - parking_lot::RwLock for the watchlist, phase table, and config.
//   - The rolling buffer locks internally per operation.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::aggregate::WindowStats;
use crate::buffer::{BufferStats, RollingTradeBuffer};
use crate::config::TrackerConfig;
use crate::lifecycle::PhaseTable;
use crate::metrics::TrackerMetrics;
use crate::types::{ActiveTokenRecord, TradeEvent};

/// Current unix time as fractional seconds.
pub fn unix_now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// One tracked token: its registry metadata, the open flush window, and the
/// flush schedule.
#[derive(Debug, Clone)]
pub struct TrackedToken {
    pub meta: ActiveTokenRecord,
    pub window: WindowStats,
    pub interval_seconds: i64,
    /// Unix seconds of the next scheduled flush.
    pub next_flush: f64,
}

impl TrackedToken {
    pub fn new(meta: ActiveTokenRecord, interval_seconds: i64, now_ts: f64) -> Self {
        Self {
            meta,
            window: WindowStats::new(),
            interval_seconds,
            next_flush: now_ts + interval_seconds as f64,
        }
    }
}

/// Connection and error status shared with the health surface.
#[derive(Default)]
pub struct ConnectionStatus {
    pub ws_connected: AtomicBool,
    pub new_token_connected: AtomicBool,
    pub db_connected: AtomicBool,
    pub reconnect_count: AtomicU64,
    /// Unix millis of the last message on the trade socket; 0 = never.
    pub last_message_unix_ms: AtomicU64,
    pub last_error: RwLock<Option<String>>,
}

/// Central tracker state.
pub struct TrackerCore {
    pub config: RwLock<TrackerConfig>,
    pub buffer: RollingTradeBuffer,
    /// Tracked tokens by address. Keys double as the set of addresses whose
    /// trade subscription is owned by the registry-backed active set.
    pub watchlist: RwLock<HashMap<String, TrackedToken>>,
    /// Addresses already subscribed on the trade socket, including tokens
    /// seen on the new-token stream before any registry record exists.
    pub early_subscribed: RwLock<HashSet<String>>,
    pub phases: RwLock<PhaseTable>,
    pub metrics: TrackerMetrics,
    pub status: ConnectionStatus,
    pub total_trades: AtomicU64,
    pub total_metrics_saved: AtomicU64,
    pub start_time: Instant,
    pub connection_start: RwLock<Option<Instant>>,
}

impl TrackerCore {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Ok(Self {
            config: RwLock::new(config),
            buffer: RollingTradeBuffer::new(),
            watchlist: RwLock::new(HashMap::new()),
            early_subscribed: RwLock::new(HashSet::new()),
            phases: RwLock::new(PhaseTable::default()),
            metrics: TrackerMetrics::new()?,
            status: ConnectionStatus::default(),
            total_trades: AtomicU64::new(0),
            total_metrics_saved: AtomicU64::new(0),
            start_time: Instant::now(),
            connection_start: RwLock::new(None),
        })
    }

    // ── Trade ingestion ─────────────────────────────────────────────────

    /// Record a trade in the rolling buffer. Every parsed trade passes
    /// through here exactly once.
    pub fn buffer_trade(&self, trade: TradeEvent, now_ts: f64) {
        self.buffer.append(trade, now_ts);
        self.metrics.buffer_trades_total.inc();
    }

    /// Apply a trade to its aggregator when the token is tracked. Returns
    /// whether the trade was applied.
    pub fn process_trade(&self, trade: &TradeEvent) -> bool {
        let whale_threshold = self.config.read().whale_threshold;
        let mut watchlist = self.watchlist.write();
        let Some(entry) = watchlist.get_mut(&trade.mint) else {
            return false;
        };
        let creator = entry.meta.creator_address.clone();
        entry.window.apply(trade, &creator, whale_threshold);
        true
    }

    // ── Status updates ──────────────────────────────────────────────────

    pub fn set_ws_connected(&self, connected: bool) {
        self.status.ws_connected.store(connected, Ordering::SeqCst);
        self.metrics.ws_connected.set(connected as i64);
        if connected {
            *self.connection_start.write() = Some(Instant::now());
            *self.status.last_error.write() = None;
        } else {
            *self.connection_start.write() = None;
        }
    }

    pub fn set_new_token_connected(&self, connected: bool) {
        self.status
            .new_token_connected
            .store(connected, Ordering::SeqCst);
        self.metrics.new_token_connected.set(connected as i64);
    }

    pub fn set_db_connected(&self, connected: bool) {
        self.status.db_connected.store(connected, Ordering::SeqCst);
        self.metrics.db_connected.set(connected as i64);
    }

    pub fn record_error(&self, prefix: &str, err: &str) {
        // Truncate on char boundaries; store errors can echo non-ASCII data.
        let msg: String = format!("{prefix}: {err}").chars().take(120).collect();
        *self.status.last_error.write() = Some(msg);
    }

    pub fn mark_message_received(&self) {
        self.status
            .last_message_unix_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    // ── Health snapshot ─────────────────────────────────────────────────

    /// Build the `/health` payload.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let db = self.status.db_connected.load(Ordering::SeqCst);
        let ws = self.status.ws_connected.load(Ordering::SeqCst);

        let status = match (db, ws) {
            (true, true) => "healthy",
            (false, false) => "unavailable",
            _ => "degraded",
        };

        let last_ms = self.status.last_message_unix_ms.load(Ordering::Relaxed);
        let last_message_ago = if last_ms == 0 {
            None
        } else {
            let now_ms = Utc::now().timestamp_millis() as u64;
            Some(now_ms.saturating_sub(last_ms) / 1000)
        };

        HealthSnapshot {
            status,
            db_connected: db,
            ws_connected: ws,
            new_token_connected: self.status.new_token_connected.load(Ordering::SeqCst),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            coins_tracked: self.watchlist.read().len(),
            total_trades: self.total_trades.load(Ordering::Relaxed),
            total_metrics_saved: self.total_metrics_saved.load(Ordering::Relaxed),
            last_message_ago,
            reconnect_count: self.status.reconnect_count.load(Ordering::Relaxed),
            last_error: self.status.last_error.read().clone(),
            buffer_stats: self.buffer.stats(),
        }
    }

    /// Whether the health surface should answer 200 (at least one of the two
    /// links is serving) or 503 (both down).
    pub fn is_serving(&self) -> bool {
        self.status.db_connected.load(Ordering::SeqCst)
            || self.status.ws_connected.load(Ordering::SeqCst)
    }

    /// Refresh the scrape-time gauges on the metrics endpoint.
    pub fn refresh_runtime_gauges(&self) {
        self.metrics
            .uptime_seconds
            .set(self.start_time.elapsed().as_secs_f64());
        let connection_age = self
            .connection_start
            .read()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.metrics.connection_duration_seconds.set(connection_age);
        self.metrics
            .trade_buffer_size
            .set(self.buffer.total_len() as i64);
    }
}

/// `/health` response payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub db_connected: bool,
    pub ws_connected: bool,
    pub new_token_connected: bool,
    pub uptime_seconds: u64,
    pub coins_tracked: usize,
    pub total_trades: u64,
    pub total_metrics_saved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_ago: Option<u64>,
    pub reconnect_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub buffer_stats: BufferStats,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
