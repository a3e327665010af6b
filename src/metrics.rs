// =============================================================================
// Prometheus telemetry — counters, gauges, and histograms for the tracker
// =============================================================================
//
// All handles live on a single `TrackerMetrics` value owned by the core, so
// no process-level registry globals exist. `/metrics` renders via
// `TextEncoder`.
// =============================================================================

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Full metric catalogue for the tracker process.
pub struct TrackerMetrics {
    registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    pub trades_received: IntCounter,
    pub trades_processed: IntCounter,
    pub trades_from_buffer: IntCounter,
    pub trades_malformed: IntCounter,
    pub metrics_saved: IntCounter,
    pub metrics_lost: IntCounter,
    pub coins_graduated: IntCounter,
    pub coins_finished: IntCounter,
    pub phase_switches: IntCounter,
    pub ws_reconnects: IntCounter,
    pub buffer_trades_total: IntCounter,
    /// DB failures labeled by operation: connection, query, update, insert.
    pub db_errors: IntCounterVec,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub coins_tracked: IntGauge,
    pub ws_connected: IntGauge,
    pub new_token_connected: IntGauge,
    pub db_connected: IntGauge,
    pub uptime_seconds: Gauge,
    pub connection_duration_seconds: Gauge,
    pub last_trade_timestamp: Gauge,
    pub trade_buffer_size: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    pub db_query_duration: Histogram,
    pub flush_duration: Histogram,
}

impl TrackerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let trades_received = int_counter(
            &registry,
            "tracker_trades_received_total",
            "Trades received from the venue stream",
        )?;
        let trades_processed = int_counter(
            &registry,
            "tracker_trades_processed_total",
            "Trades applied to a tracked aggregator",
        )?;
        let trades_from_buffer = int_counter(
            &registry,
            "tracker_trades_from_buffer_total",
            "Trades replayed from the rolling buffer on activation",
        )?;
        let trades_malformed = int_counter(
            &registry,
            "tracker_trades_malformed_total",
            "Inbound frames dropped at the parse boundary",
        )?;
        let metrics_saved = int_counter(
            &registry,
            "tracker_metrics_saved_total",
            "Metric rows written to the store",
        )?;
        let metrics_lost = int_counter(
            &registry,
            "tracker_metrics_lost_total",
            "Metric rows dropped because a batch write failed",
        )?;
        let coins_graduated = int_counter(
            &registry,
            "tracker_coins_graduated_total",
            "Tokens that crossed the graduation threshold",
        )?;
        let coins_finished = int_counter(
            &registry,
            "tracker_coins_finished_total",
            "Tokens that aged out of their last phase",
        )?;
        let phase_switches = int_counter(
            &registry,
            "tracker_phase_switches_total",
            "Phase promotions",
        )?;
        let ws_reconnects = int_counter(
            &registry,
            "tracker_ws_reconnects_total",
            "WebSocket reconnect attempts",
        )?;
        let buffer_trades_total = int_counter(
            &registry,
            "tracker_buffer_trades_total",
            "Trades appended to the rolling buffer",
        )?;

        let db_errors = IntCounterVec::new(
            Opts::new("tracker_db_errors_total", "DB errors by operation"),
            &["type"],
        )
        .context("failed to build db_errors counter")?;
        registry
            .register(Box::new(db_errors.clone()))
            .context("failed to register db_errors")?;

        let coins_tracked = int_gauge(
            &registry,
            "tracker_coins_tracked",
            "Tokens currently tracked",
        )?;
        let ws_connected = int_gauge(
            &registry,
            "tracker_ws_connected",
            "Trade WebSocket status (1=connected)",
        )?;
        let new_token_connected = int_gauge(
            &registry,
            "tracker_new_token_connected",
            "New-token WebSocket status (1=connected)",
        )?;
        let db_connected = int_gauge(
            &registry,
            "tracker_db_connected",
            "DB status (1=connected)",
        )?;
        let uptime_seconds = gauge(&registry, "tracker_uptime_seconds", "Process uptime")?;
        let connection_duration_seconds = gauge(
            &registry,
            "tracker_connection_duration_seconds",
            "Age of the current trade connection",
        )?;
        let last_trade_timestamp = gauge(
            &registry,
            "tracker_last_trade_timestamp",
            "Unix timestamp of the last processed trade",
        )?;
        let trade_buffer_size = int_gauge(
            &registry,
            "tracker_trade_buffer_size",
            "Trades currently held in the rolling buffer",
        )?;

        let db_query_duration = histogram(
            &registry,
            "tracker_db_query_duration_seconds",
            "Duration of active-set reads",
        )?;
        let flush_duration = histogram(
            &registry,
            "tracker_flush_duration_seconds",
            "Duration of metric batch writes",
        )?;

        Ok(Self {
            registry,
            trades_received,
            trades_processed,
            trades_from_buffer,
            trades_malformed,
            metrics_saved,
            metrics_lost,
            coins_graduated,
            coins_finished,
            phase_switches,
            ws_reconnects,
            buffer_trades_total,
            db_errors,
            coins_tracked,
            ws_connected,
            new_token_connected,
            db_connected,
            uptime_seconds,
            connection_duration_seconds,
            last_trade_timestamp,
            trade_buffer_size,
            db_query_duration,
            flush_duration,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut out = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut out)
            .context("failed to encode metrics")?;
        String::from_utf8(out).context("metrics output was not valid UTF-8")
    }
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help).with_context(|| format!("failed to build {name}"))?;
    registry
        .register(Box::new(c.clone()))
        .with_context(|| format!("failed to register {name}"))?;
    Ok(c)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help).with_context(|| format!("failed to build {name}"))?;
    registry
        .register(Box::new(g.clone()))
        .with_context(|| format!("failed to register {name}"))?;
    Ok(g)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let g = Gauge::new(name, help).with_context(|| format!("failed to build {name}"))?;
    registry
        .register(Box::new(g.clone()))
        .with_context(|| format!("failed to register {name}"))?;
    Ok(g)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let h = Histogram::with_opts(HistogramOpts::new(name, help))
        .with_context(|| format!("failed to build {name}"))?;
    registry
        .register(Box::new(h.clone()))
        .with_context(|| format!("failed to register {name}"))?;
    Ok(h)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_registers_and_renders() {
        let metrics = TrackerMetrics::new().unwrap();
        metrics.trades_received.inc();
        metrics.metrics_saved.inc_by(3);
        metrics.db_errors.with_label_values(&["insert"]).inc();
        metrics.coins_tracked.set(7);

        let text = metrics.render().unwrap();
        assert!(text.contains("tracker_trades_received_total 1"));
        assert!(text.contains("tracker_metrics_saved_total 3"));
        assert!(text.contains("tracker_coins_tracked 7"));
        assert!(text.contains(r#"tracker_db_errors_total{type="insert"} 1"#));
    }

    #[test]
    fn two_catalogues_do_not_collide() {
        // Each instance owns its registry, so tests and reload paths can
        // build them independently.
        let a = TrackerMetrics::new().unwrap();
        let b = TrackerMetrics::new().unwrap();
        a.trades_received.inc();
        assert!(b.render().unwrap().contains("tracker_trades_received_total 0"));
    }
}
