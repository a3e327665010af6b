// =============================================================================
// Rolling trade buffer — per-token time-windowed trade log
// =============================================================================
//
// Every trade the venue delivers lands here first, keyed by token address,
// regardless of whether the token is already in the tracked set. When a token
// is activated later, the missed trades are replayed from this buffer so the
// first flush window is complete.
//
// Pure in-memory state; empty after a restart.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::TradeEvent;

/// Hard cap on buffered trades per token; the oldest entries are dropped.
const PER_TOKEN_CAP: usize = 5_000;

/// How many tokens the health endpoint lists by buffer size.
const TOP_TOKENS: usize = 10;

/// Buffer summary exposed on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub total_trades_in_buffer: usize,
    pub coins_with_buffer: usize,
    pub buffer_details: Vec<BufferTopEntry>,
}

/// One entry of the top-N-by-buffer-size listing.
#[derive(Debug, Clone, Serialize)]
pub struct BufferTopEntry {
    pub token: String,
    pub trades: usize,
}

/// Thread-safe rolling buffer of `(received_ts, trade)` entries per token.
///
/// Timestamps are unix seconds supplied by the caller so that tests can
/// inject a clock.
pub struct RollingTradeBuffer {
    inner: RwLock<HashMap<String, VecDeque<(f64, TradeEvent)>>>,
}

impl RollingTradeBuffer {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append a trade received at `now_ts`. Entries are appended in arrival
    /// order, so each per-token sequence is chronologically sorted.
    pub fn append(&self, trade: TradeEvent, now_ts: f64) {
        let mut map = self.inner.write();
        let ring = map
            .entry(trade.mint.clone())
            .or_insert_with(VecDeque::new);
        ring.push_back((now_ts, trade));
        while ring.len() > PER_TOKEN_CAP {
            ring.pop_front();
        }
    }

    /// Remove all entries with `ts <= cutoff_ts`; tokens left empty are
    /// dropped entirely. Returns the number of removed trades.
    pub fn evict_older_than(&self, cutoff_ts: f64) -> usize {
        let mut map = self.inner.write();
        let mut removed = 0;
        map.retain(|_, ring| {
            while ring.front().is_some_and(|(ts, _)| *ts <= cutoff_ts) {
                ring.pop_front();
                removed += 1;
            }
            !ring.is_empty()
        });
        removed
    }

    /// Return a chronological snapshot of the trades for `mint` with
    /// `from_ts <= ts <= to_ts`. Appends racing with the snapshot are not
    /// observed; the returned prefix is consistent.
    pub fn replay(&self, mint: &str, from_ts: f64, to_ts: f64) -> Vec<TradeEvent> {
        let map = self.inner.read();
        match map.get(mint) {
            Some(ring) => ring
                .iter()
                .filter(|(ts, _)| *ts >= from_ts && *ts <= to_ts)
                .map(|(_, trade)| trade.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Total number of buffered trades across all tokens.
    pub fn total_len(&self) -> usize {
        self.inner.read().values().map(VecDeque::len).sum()
    }

    /// Build the `/health` summary: totals plus the top tokens by buffer
    /// size, addresses truncated for display.
    pub fn stats(&self) -> BufferStats {
        let map = self.inner.read();
        let total: usize = map.values().map(VecDeque::len).sum();

        let mut counts: Vec<(String, usize)> = map
            .iter()
            .map(|(mint, ring)| (mint.clone(), ring.len()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        let buffer_details = counts
            .into_iter()
            .take(TOP_TOKENS)
            .map(|(mint, trades)| BufferTopEntry {
                token: truncate_address(&mint),
                trades,
            })
            .collect();

        BufferStats {
            total_trades_in_buffer: total,
            coins_with_buffer: map.len(),
            buffer_details,
        }
    }
}

impl Default for RollingTradeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_address(mint: &str) -> String {
    if mint.len() > 12 {
        format!("{}...", &mint[..12])
    } else {
        mint.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeKind;

    fn sample_trade(mint: &str, sol: f64) -> TradeEvent {
        TradeEvent {
            mint: mint.into(),
            trader: "Trader1".into(),
            kind: TradeKind::Buy,
            sol_amount: sol,
            v_sol_reserves: 30.0,
            v_token_reserves: 1_000_000_000.0,
        }
    }

    #[test]
    fn replay_returns_chronological_window() {
        let buf = RollingTradeBuffer::new();
        buf.append(sample_trade("M", 0.1), 10.0);
        buf.append(sample_trade("M", 0.2), 20.0);
        buf.append(sample_trade("M", 0.3), 30.0);
        buf.append(sample_trade("M", 0.4), 40.0);

        let trades = buf.replay("M", 15.0, 35.0);
        assert_eq!(trades.len(), 2);
        assert!((trades[0].sol_amount - 0.2).abs() < f64::EPSILON);
        assert!((trades[1].sol_amount - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn replay_range_is_inclusive() {
        let buf = RollingTradeBuffer::new();
        buf.append(sample_trade("M", 0.1), 10.0);
        buf.append(sample_trade("M", 0.2), 20.0);

        let trades = buf.replay("M", 10.0, 20.0);
        assert_eq!(trades.len(), 2);
    }

    #[test]
    fn replay_empty_range_is_noop() {
        let buf = RollingTradeBuffer::new();
        buf.append(sample_trade("M", 0.1), 10.0);
        assert!(buf.replay("M", 11.0, 11.0).is_empty());
        assert!(buf.replay("OTHER", 0.0, 100.0).is_empty());
    }

    #[test]
    fn eviction_drops_old_entries_and_empty_tokens() {
        let buf = RollingTradeBuffer::new();
        buf.append(sample_trade("A", 0.1), 10.0);
        buf.append(sample_trade("A", 0.2), 50.0);
        buf.append(sample_trade("B", 0.3), 5.0);

        let removed = buf.evict_older_than(10.0);
        assert_eq!(removed, 2);
        assert_eq!(buf.total_len(), 1);

        let stats = buf.stats();
        assert_eq!(stats.coins_with_buffer, 1);
        assert_eq!(stats.total_trades_in_buffer, 1);
    }

    #[test]
    fn eviction_after_buffer_window_empties_replay() {
        // Append at t, advance 200s past a 180s window, evict, replay [t, t+200].
        let buf = RollingTradeBuffer::new();
        let t = 1_000.0;
        buf.append(sample_trade("M", 0.5), t);

        let now = t + 200.0;
        buf.evict_older_than(now - 180.0);

        assert!(buf.replay("M", t, t + 200.0).is_empty());
        assert_eq!(buf.total_len(), 0);
    }

    #[test]
    fn per_token_cap_keeps_newest() {
        let buf = RollingTradeBuffer::new();
        for i in 0..(PER_TOKEN_CAP + 100) {
            buf.append(sample_trade("M", i as f64), i as f64);
        }
        assert_eq!(buf.total_len(), PER_TOKEN_CAP);

        // Oldest surviving entry is number 100.
        let trades = buf.replay("M", 0.0, f64::MAX);
        assert!((trades[0].sol_amount - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_lists_top_tokens_truncated() {
        let buf = RollingTradeBuffer::new();
        let long_mint = "AVeryLongMintAddressThatGetsTruncated";
        buf.append(sample_trade(long_mint, 0.1), 1.0);
        buf.append(sample_trade(long_mint, 0.2), 2.0);
        buf.append(sample_trade("short", 0.3), 3.0);

        let stats = buf.stats();
        assert_eq!(stats.total_trades_in_buffer, 3);
        assert_eq!(stats.buffer_details[0].token, "AVeryLongMin...");
        assert_eq!(stats.buffer_details[0].trades, 2);
        assert_eq!(stats.buffer_details[1].token, "short");
    }
}
