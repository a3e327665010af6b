// =============================================================================
// Registry client — Postgres reads/writes for the tracked-token registry
// =============================================================================
//
// The registry is the source of truth for the active set; this client reads
// it, writes phase transitions and terminal lifecycle states back, and bulk
// inserts flushed metric rows. All statements are runtime queries so no
// database is needed at build time.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::aggregate::MetricRow;
use crate::lifecycle::{PhaseConfig, PHASE_FINISHED, PHASE_GRADUATED};
use crate::types::ActiveTokenRecord;

/// Upper bound on concurrent registry queries.
const POOL_MAX_CONNECTIONS: u32 = 10;

/// Postgres-backed registry client.
pub struct RegistryClient {
    pool: PgPool,
}

impl RegistryClient {
    /// Connect a pool to `dsn`. Fails fast; the caller owns the retry loop.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(POOL_MAX_CONNECTIONS)
            .connect(dsn)
            .await
            .context("failed to connect to the registry database")?;
        Ok(Self { pool })
    }

    /// Load the ordered phase descriptors from `ref_coin_phases`.
    pub async fn load_phases(&self) -> Result<Vec<PhaseConfig>> {
        let rows = sqlx::query(
            "SELECT id, name, interval_seconds, max_age_minutes \
             FROM ref_coin_phases ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load phase config")?;

        let mut phases = Vec::with_capacity(rows.len());
        for row in rows {
            phases.push(PhaseConfig {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                interval_seconds: row.try_get::<i32, _>("interval_seconds")? as i64,
                max_age_minutes: row.try_get::<i32, _>("max_age_minutes")? as i64,
            });
        }

        info!(
            phases = ?phases
                .iter()
                .map(|p| format!("{}:{}", p.id, p.name))
                .collect::<Vec<_>>(),
            "phase config loaded"
        );
        Ok(phases)
    }

    /// Opportunistic backfill of missing active records; the function may not
    /// exist in every deployment, so failures are only logged.
    pub async fn repair_missing_streams(&self) {
        if let Err(e) = sqlx::query("SELECT repair_missing_streams()")
            .execute(&self.pool)
            .await
        {
            debug!(error = %e, "repair_missing_streams unavailable");
        }
    }

    /// Read the active set joined to the discovery table.
    ///
    /// Null `created_at` defaults to now, null `started_at` to `created_at`,
    /// and a missing creator to the empty string.
    pub async fn fetch_active(&self) -> Result<HashMap<String, ActiveTokenRecord>> {
        let rows = sqlx::query(
            "SELECT cs.token_address, cs.current_phase_id, cs.started_at, \
                    dc.token_created_at, dc.trader_public_key \
             FROM coin_streams cs \
             JOIN discovered_coins dc ON cs.token_address = dc.token_address \
             WHERE cs.is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to read the active set")?;

        let mut active = HashMap::with_capacity(rows.len());
        for row in rows {
            let mint: String = row.try_get("token_address")?;
            let created_at: Option<DateTime<Utc>> = row.try_get("token_created_at")?;
            let started_at: Option<DateTime<Utc>> = row.try_get("started_at")?;
            let creator: Option<String> = row.try_get("trader_public_key")?;

            let created_at = created_at.unwrap_or_else(Utc::now);
            active.insert(
                mint,
                ActiveTokenRecord {
                    phase_id: row.try_get("current_phase_id")?,
                    created_at,
                    started_at: started_at.unwrap_or(created_at),
                    creator_address: creator.unwrap_or_default(),
                },
            );
        }
        Ok(active)
    }

    /// Atomically move a token to a new phase.
    pub async fn set_phase(&self, mint: &str, new_phase_id: i32) -> Result<()> {
        sqlx::query("UPDATE coin_streams SET current_phase_id = $1 WHERE token_address = $2")
            .bind(new_phase_id)
            .bind(mint)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to switch phase for {mint}"))?;
        Ok(())
    }

    /// Terminal lifecycle write: deactivate the stream and record whether the
    /// token graduated or simply finished.
    pub async fn end_stream(&self, mint: &str, graduated: bool) -> Result<()> {
        let final_phase = if graduated {
            PHASE_GRADUATED
        } else {
            PHASE_FINISHED
        };
        sqlx::query(
            "UPDATE coin_streams \
             SET is_active = FALSE, current_phase_id = $2, is_graduated = $3 \
             WHERE token_address = $1",
        )
        .bind(mint)
        .bind(final_phase)
        .bind(graduated)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to end stream for {mint}"))?;
        Ok(())
    }

    /// Write one flushed batch as a single bulk insert. The whole batch
    /// either lands or is lost; the caller counts the loss.
    pub async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO coin_metrics (\
             token_address, timestamp, phase_id_at_time, \
             price_open, price_high, price_low, price_close, market_cap_close, \
             bonding_curve_pct, virtual_sol_reserves, is_koth, \
             volume_sol, buy_volume_sol, sell_volume_sol, \
             num_buys, num_sells, unique_wallets, num_micro_trades, \
             dev_sold_amount, max_single_buy_sol, max_single_sell_sol, \
             net_volume_sol, volatility_pct, avg_trade_size_sol, \
             whale_buy_volume_sol, whale_sell_volume_sol, \
             num_whale_buys, num_whale_sells, \
             buy_pressure_ratio, unique_signer_ratio) ",
        );

        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.token_address)
                .push_bind(row.window_close_ts)
                .push_bind(row.phase_id)
                .push_bind(row.open)
                .push_bind(row.high)
                .push_bind(row.low)
                .push_bind(row.close)
                .push_bind(row.market_cap_close)
                .push_bind(row.bonding_curve_pct)
                .push_bind(row.virtual_sol_reserves)
                .push_bind(row.is_king_of_hill)
                .push_bind(row.total_vol)
                .push_bind(row.buy_vol)
                .push_bind(row.sell_vol)
                .push_bind(row.num_buys)
                .push_bind(row.num_sells)
                .push_bind(row.unique_wallets)
                .push_bind(row.num_micro_trades)
                .push_bind(row.dev_sold_amount)
                .push_bind(row.max_single_buy)
                .push_bind(row.max_single_sell)
                .push_bind(row.net_volume)
                .push_bind(row.volatility_pct)
                .push_bind(row.avg_trade_size)
                .push_bind(row.whale_buy_vol)
                .push_bind(row.whale_sell_vol)
                .push_bind(row.num_whale_buys)
                .push_bind(row.num_whale_sells)
                .push_bind(row.buy_pressure_ratio)
                .push_bind(row.unique_signer_ratio);
        });

        qb.build()
            .execute(&self.pool)
            .await
            .context("failed to bulk insert metric rows")?;
        Ok(())
    }
}
