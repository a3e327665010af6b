// =============================================================================
// Per-token window accumulator and flushed metric rows
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::types::{TradeEvent, TradeKind};

/// Trades strictly below this size count as micro trades (reserve units).
const MICRO_TRADE_MAX_SOL: f64 = 0.01;

/// Market-cap proxy threshold for the King-of-the-Hill flag.
const KOTH_MCAP: f64 = 30_000.0;

/// Nominal total supply used as a market-cap proxy; the venue does not
/// publish a per-token supply in the trade event.
const NOMINAL_TOKEN_SUPPLY: f64 = 1_000_000_000.0;

/// Accumulator for one token over the current flush window.
///
/// `open` doubles as the emptiness marker for price fields: until the first
/// trade lands, high/low/close are unset zeros.
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub open: Option<f64>,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub total_vol: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub num_buys: u32,
    pub num_sells: u32,
    pub micro_trades: u32,
    pub max_buy: f64,
    pub max_sell: f64,
    pub unique_traders: HashSet<String>,
    pub last_v_sol: f64,
    pub last_mcap: f64,
    pub whale_buy_vol: f64,
    pub whale_sell_vol: f64,
    pub num_whale_buys: u32,
    pub num_whale_sells: u32,
    pub dev_sold_amount: f64,
}

impl WindowStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trade into the window.
    ///
    /// `creator` is the token's creator address used for the dev-sell test;
    /// an empty creator never matches.
    pub fn apply(&mut self, trade: &TradeEvent, creator: &str, whale_threshold: f64) {
        let price = trade.price();
        let sol = trade.sol_amount;

        match self.open {
            None => {
                self.open = Some(price);
                self.high = price;
                self.low = price;
            }
            Some(_) => {
                self.high = self.high.max(price);
                self.low = self.low.min(price);
            }
        }
        self.close = price;

        self.total_vol += sol;
        let is_whale = sol >= whale_threshold;
        match trade.kind {
            TradeKind::Buy => {
                self.num_buys += 1;
                self.buy_vol += sol;
                self.max_buy = self.max_buy.max(sol);
                if is_whale {
                    self.num_whale_buys += 1;
                    self.whale_buy_vol += sol;
                }
            }
            TradeKind::Sell => {
                self.num_sells += 1;
                self.sell_vol += sol;
                self.max_sell = self.max_sell.max(sol);
                if is_whale {
                    self.num_whale_sells += 1;
                    self.whale_sell_vol += sol;
                }
                if !creator.is_empty() && trade.trader == creator {
                    self.dev_sold_amount += sol;
                }
            }
        }

        if sol < MICRO_TRADE_MAX_SOL {
            self.micro_trades += 1;
        }

        self.unique_traders.insert(trade.trader.clone());
        self.last_v_sol = trade.v_sol_reserves;
        self.last_mcap = price * NOMINAL_TOKEN_SUPPLY;
    }

    /// Whether the window has seen any volume.
    pub fn is_empty(&self) -> bool {
        self.total_vol <= 0.0
    }

    /// Bonding-curve progress implied by the last observed reserves.
    pub fn bonding_curve_pct(&self, sol_reserves_full: f64) -> f64 {
        (self.last_v_sol / sol_reserves_full) * 100.0
    }

    /// Close the window into a metric row, or `None` when no volume was
    /// observed. Does not reset the window; the caller swaps in a fresh one.
    pub fn finish(
        &self,
        mint: &str,
        window_close_ts: DateTime<Utc>,
        phase_id: i32,
        sol_reserves_full: f64,
    ) -> Option<MetricRow> {
        if self.is_empty() {
            return None;
        }

        let open = self.open.unwrap_or(0.0);
        let num_trades = self.num_buys + self.num_sells;
        let traded_vol = self.buy_vol + self.sell_vol;

        let volatility_pct = if open > 0.0 {
            (self.high - self.low) / open * 100.0
        } else {
            0.0
        };
        let avg_trade_size = if num_trades > 0 {
            self.total_vol / num_trades as f64
        } else {
            0.0
        };
        let buy_pressure_ratio = if traded_vol > 0.0 {
            self.buy_vol / traded_vol
        } else {
            0.0
        };
        let unique_signer_ratio = if num_trades > 0 {
            self.unique_traders.len() as f64 / num_trades as f64
        } else {
            0.0
        };

        Some(MetricRow {
            token_address: mint.to_string(),
            window_close_ts,
            phase_id,
            open,
            high: self.high,
            low: self.low,
            close: self.close,
            market_cap_close: self.last_mcap,
            bonding_curve_pct: self.bonding_curve_pct(sol_reserves_full),
            virtual_sol_reserves: self.last_v_sol,
            is_king_of_hill: self.last_mcap > KOTH_MCAP,
            total_vol: self.total_vol,
            buy_vol: self.buy_vol,
            sell_vol: self.sell_vol,
            num_buys: self.num_buys as i32,
            num_sells: self.num_sells as i32,
            unique_wallets: self.unique_traders.len() as i32,
            num_micro_trades: self.micro_trades as i32,
            dev_sold_amount: self.dev_sold_amount,
            max_single_buy: self.max_buy,
            max_single_sell: self.max_sell,
            net_volume: self.buy_vol - self.sell_vol,
            volatility_pct,
            avg_trade_size,
            whale_buy_vol: self.whale_buy_vol,
            whale_sell_vol: self.whale_sell_vol,
            num_whale_buys: self.num_whale_buys as i32,
            num_whale_sells: self.num_whale_sells as i32,
            buy_pressure_ratio,
            unique_signer_ratio,
        })
    }
}

/// One flushed metrics row, matching the `coin_metrics` table columns.
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub token_address: String,
    pub window_close_ts: DateTime<Utc>,
    pub phase_id: i32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub market_cap_close: f64,
    pub bonding_curve_pct: f64,
    pub virtual_sol_reserves: f64,
    pub is_king_of_hill: bool,
    pub total_vol: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub num_buys: i32,
    pub num_sells: i32,
    pub unique_wallets: i32,
    pub num_micro_trades: i32,
    pub dev_sold_amount: f64,
    pub max_single_buy: f64,
    pub max_single_sell: f64,
    pub net_volume: f64,
    pub volatility_pct: f64,
    pub avg_trade_size: f64,
    pub whale_buy_vol: f64,
    pub whale_sell_vol: f64,
    pub num_whale_buys: i32,
    pub num_whale_sells: i32,
    pub buy_pressure_ratio: f64,
    pub unique_signer_ratio: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
