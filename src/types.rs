// =============================================================================
// Shared types used across the curve tracker
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Direction of a bonding-curve trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// A single parsed trade from the venue trade stream.
///
/// Only fields the tracker consumes are kept; everything else in the inbound
/// frame is discarded at the parse boundary.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    /// Token address the trade belongs to.
    pub mint: String,
    /// Wallet that signed the trade.
    pub trader: String,
    pub kind: TradeKind,
    /// Trade size in units of the reserve asset (SOL).
    pub sol_amount: f64,
    /// Virtual SOL reserves after the trade.
    pub v_sol_reserves: f64,
    /// Virtual token reserves after the trade. Always > 0 for a parsed trade.
    pub v_token_reserves: f64,
}

impl TradeEvent {
    /// Spot price implied by the virtual reserves.
    pub fn price(&self) -> f64 {
        self.v_sol_reserves / self.v_token_reserves
    }
}

/// Active-registry row for a tracked token.
#[derive(Debug, Clone)]
pub struct ActiveTokenRecord {
    pub phase_id: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Wallet that created the token. Empty when discovery did not capture it.
    pub creator_address: String,
}

/// A classified inbound frame from the venue WebSocket.
#[derive(Debug, Clone)]
pub enum UpstreamMessage {
    /// A token creation event (`txType == "create"`).
    NewToken { mint: String },
    /// A buy or sell event for a subscribed token.
    Trade(TradeEvent),
    /// Subscription acks and other frames without a `txType`.
    Control,
}

/// Parse an inbound venue frame.
///
/// Frames lacking `txType` are control/ack frames and map to
/// [`UpstreamMessage::Control`]. Buy/sell frames with missing mandatory
/// fields, unparseable numbers, or zero token reserves are errors; the caller
/// counts and drops them.
pub fn parse_upstream(text: &str) -> Result<UpstreamMessage> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse upstream JSON")?;

    let tx_type = match root.get("txType").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return Ok(UpstreamMessage::Control),
    };

    match tx_type {
        "create" => {
            let mint = root["mint"]
                .as_str()
                .context("create event missing field mint")?
                .to_string();
            Ok(UpstreamMessage::NewToken { mint })
        }
        "buy" | "sell" => {
            let kind = if tx_type == "buy" {
                TradeKind::Buy
            } else {
                TradeKind::Sell
            };

            let mint = root["mint"]
                .as_str()
                .context("trade event missing field mint")?
                .to_string();
            let trader = root["traderPublicKey"]
                .as_str()
                .context("trade event missing field traderPublicKey")?
                .to_string();

            let sol_amount = parse_field_f64(&root["solAmount"], "solAmount")?;
            let v_sol_reserves =
                parse_field_f64(&root["vSolInBondingCurve"], "vSolInBondingCurve")?;
            let v_token_reserves =
                parse_field_f64(&root["vTokensInBondingCurve"], "vTokensInBondingCurve")?;

            if v_token_reserves <= 0.0 {
                anyhow::bail!("trade event has non-positive vTokensInBondingCurve");
            }

            Ok(UpstreamMessage::Trade(TradeEvent {
                mint,
                trader,
                kind,
                sol_amount,
                v_sol_reserves,
                v_token_reserves,
            }))
        }
        _ => Ok(UpstreamMessage::Control),
    }
}

/// Helper: the venue sends numeric values either as JSON numbers or strings.
fn parse_field_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} is missing or has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
