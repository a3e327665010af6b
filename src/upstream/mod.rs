// =============================================================================
// Upstream venue client — shared WebSocket plumbing
// =============================================================================

pub mod token_stream;
pub mod trade_stream;

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Soft read timeout: the loop stays responsive to subscribe requests and
/// ping cadence even when the venue is quiet.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one socket read attempt.
pub enum ReadOutcome {
    Frame(Message),
    /// No frame within the soft timeout; not an error by itself.
    IdleTimeout,
    /// The peer closed the stream.
    Closed,
}

/// Read the next frame with the soft timeout applied. Transport errors are
/// returned as `Err` and treated as a disconnect by the caller.
pub async fn read_next(source: &mut WsSource) -> Result<ReadOutcome> {
    match tokio::time::timeout(READ_TIMEOUT, source.next()).await {
        Err(_) => Ok(ReadOutcome::IdleTimeout),
        Ok(None) => Ok(ReadOutcome::Closed),
        Ok(Some(Err(e))) => Err(e).context("WebSocket read failed"),
        Ok(Some(Ok(msg))) => Ok(ReadOutcome::Frame(msg)),
    }
}

/// Reconnect delay after `failures` consecutive failures:
/// `min(base * (1 + 0.5 * failures), max)`.
pub fn retry_delay(base_secs: u64, max_secs: u64, failures: u32) -> Duration {
    let delay = base_secs as f64 * (1.0 + 0.5 * failures as f64);
    Duration::from_secs_f64(delay.min(max_secs as f64))
}

/// Control frame subscribing to token creation events.
pub fn subscribe_new_token_frame() -> String {
    serde_json::json!({ "method": "subscribeNewToken" }).to_string()
}

/// Control frame subscribing to trade events for `keys`.
pub fn subscribe_token_trade_frame(keys: &[String]) -> String {
    serde_json::json!({ "method": "subscribeTokenTrade", "keys": keys }).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_linearly_and_caps() {
        assert_eq!(retry_delay(3, 60, 0), Duration::from_secs_f64(3.0));
        assert_eq!(retry_delay(3, 60, 1), Duration::from_secs_f64(4.5));
        assert_eq!(retry_delay(3, 60, 2), Duration::from_secs_f64(6.0));
        assert_eq!(retry_delay(3, 60, 1000), Duration::from_secs_f64(60.0));
    }

    #[test]
    fn subscribe_frames_match_wire_protocol() {
        assert_eq!(
            subscribe_new_token_frame(),
            r#"{"method":"subscribeNewToken"}"#
        );

        let frame = subscribe_token_trade_frame(&["A".to_string(), "B".to_string()]);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["method"], "subscribeTokenTrade");
        assert_eq!(parsed["keys"][0], "A");
        assert_eq!(parsed["keys"][1], "B");
    }
}
