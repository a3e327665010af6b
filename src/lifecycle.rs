// =============================================================================
// Token lifecycle state machine — phase promotion, graduation, end of life
// =============================================================================
//
// Evaluated once per token per driver tick, before the flush decision.
// Graduation precedes promotion precedes flush, so terminal tokens never emit
// a post-terminal row and a promotion takes effect on the following flush.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Terminal phase id for tokens whose lifecycle ran out.
pub const PHASE_FINISHED: i32 = 99;

/// Terminal phase id for tokens that left the venue for a secondary market.
pub const PHASE_GRADUATED: i32 = 100;

/// Bonding-curve percentage at which a token graduates.
pub const GRADUATION_PCT: f64 = 99.5;

/// One row of `ref_coin_phases`.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub id: i32,
    pub name: String,
    pub interval_seconds: i64,
    pub max_age_minutes: i64,
}

/// Ordered set of the configured phases. Real phases have ids below
/// [`PHASE_FINISHED`]; promotion always targets the next real id.
#[derive(Debug, Clone, Default)]
pub struct PhaseTable {
    phases: BTreeMap<i32, PhaseConfig>,
}

impl PhaseTable {
    pub fn new(rows: Vec<PhaseConfig>) -> Self {
        let phases = rows.into_iter().map(|p| (p.id, p)).collect();
        Self { phases }
    }

    pub fn get(&self, id: i32) -> Option<&PhaseConfig> {
        self.phases.get(&id)
    }

    /// The lowest-id real phase, used as a fallback for unknown registry ids.
    pub fn first_real(&self) -> Option<&PhaseConfig> {
        self.phases.values().find(|p| p.id < PHASE_FINISHED)
    }

    /// The next real phase strictly after `id`, if any.
    pub fn next_real_after(&self, id: i32) -> Option<&PhaseConfig> {
        self.phases
            .range(id + 1..)
            .map(|(_, p)| p)
            .find(|p| p.id < PHASE_FINISHED)
    }

    /// Resolve a registry phase id to a known one, falling back to the first
    /// real phase when the registry carries an id we have no config for.
    pub fn resolve(&self, id: i32) -> Option<&PhaseConfig> {
        self.get(id).or_else(|| self.first_real())
    }
}

/// Outcome of one lifecycle evaluation for one token.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleDecision {
    /// Bonding curve crossed the graduation threshold; terminal.
    Graduate,
    /// Token aged out of the last real phase; terminal.
    Finish,
    /// Token aged out of its phase and a next real phase exists.
    Promote { next_id: i32, interval_seconds: i64 },
    /// No transition this tick.
    Keep,
}

/// Effective token age in minutes, compensated for the upstream clock offset
/// between event time and token creation time, clamped at zero.
pub fn effective_age_minutes(
    created_at: DateTime<Utc>,
    now_utc: DateTime<Utc>,
    age_offset_min: i64,
) -> f64 {
    let raw = (now_utc - created_at).num_seconds() as f64 / 60.0;
    (raw - age_offset_min as f64).max(0.0)
}

/// Evaluate the state machine for one token.
pub fn evaluate(
    table: &PhaseTable,
    phase_id: i32,
    created_at: DateTime<Utc>,
    now_utc: DateTime<Utc>,
    bonding_curve_pct: f64,
    age_offset_min: i64,
) -> LifecycleDecision {
    if bonding_curve_pct >= GRADUATION_PCT {
        return LifecycleDecision::Graduate;
    }

    let Some(phase) = table.get(phase_id) else {
        // Unknown phase id: nothing to age against until the registry or the
        // phase table catches up.
        return LifecycleDecision::Keep;
    };

    let age_min = effective_age_minutes(created_at, now_utc, age_offset_min);
    if age_min > phase.max_age_minutes as f64 {
        return match table.next_real_after(phase_id) {
            Some(next) => LifecycleDecision::Promote {
                next_id: next.id,
                interval_seconds: next.interval_seconds,
            },
            None => LifecycleDecision::Finish,
        };
    }

    LifecycleDecision::Keep
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn phase(id: i32, interval: i64, max_age: i64) -> PhaseConfig {
        PhaseConfig {
            id,
            name: format!("phase_{id}"),
            interval_seconds: interval,
            max_age_minutes: max_age,
        }
    }

    fn two_phase_table() -> PhaseTable {
        PhaseTable::new(vec![phase(1, 5, 10), phase(2, 30, 60)])
    }

    #[test]
    fn graduation_at_threshold() {
        // virtual_sol_reserves = 84.6 of 85.0 full => 99.53% >= 99.5%.
        let table = two_phase_table();
        let now = Utc::now();
        let pct = 84.6 / 85.0 * 100.0;
        let decision = evaluate(&table, 1, now, now, pct, 60);
        assert_eq!(decision, LifecycleDecision::Graduate);
    }

    #[test]
    fn graduation_beats_promotion_and_flush() {
        let table = two_phase_table();
        let now = Utc::now();
        let created = now - Duration::minutes(500);
        let decision = evaluate(&table, 1, created, now, 99.9, 60);
        assert_eq!(decision, LifecycleDecision::Graduate);
    }

    #[test]
    fn promotion_when_aged_out_of_phase() {
        // Created 75 min ago, offset 60 => effective age 15 min > 10 min cap.
        let table = two_phase_table();
        let now = Utc::now();
        let created = now - Duration::minutes(75);
        let decision = evaluate(&table, 1, created, now, 10.0, 60);
        assert_eq!(
            decision,
            LifecycleDecision::Promote {
                next_id: 2,
                interval_seconds: 30
            }
        );
    }

    #[test]
    fn finish_when_no_next_real_phase() {
        let table = two_phase_table();
        let now = Utc::now();
        let created = now - Duration::minutes(60 + 61);
        let decision = evaluate(&table, 2, created, now, 10.0, 60);
        assert_eq!(decision, LifecycleDecision::Finish);
    }

    #[test]
    fn young_token_is_kept() {
        let table = two_phase_table();
        let now = Utc::now();
        let created = now - Duration::minutes(65);
        // Effective age 5 min, below the 10 min cap of phase 1.
        let decision = evaluate(&table, 1, created, now, 10.0, 60);
        assert_eq!(decision, LifecycleDecision::Keep);
    }

    #[test]
    fn age_clamped_at_zero_for_fresh_tokens() {
        let now = Utc::now();
        let created = now - Duration::minutes(30);
        assert!((effective_age_minutes(created, now, 60) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_phase_id_is_kept() {
        let table = two_phase_table();
        let now = Utc::now();
        let created = now - Duration::minutes(1000);
        let decision = evaluate(&table, 42, created, now, 10.0, 60);
        assert_eq!(decision, LifecycleDecision::Keep);
    }

    #[test]
    fn next_real_skips_terminal_ids() {
        let table = PhaseTable::new(vec![
            phase(1, 5, 10),
            phase(PHASE_FINISHED, 0, 0),
            phase(PHASE_GRADUATED, 0, 0),
        ]);
        assert!(table.next_real_after(1).is_none());

        let now = Utc::now();
        let created = now - Duration::minutes(500);
        let decision = evaluate(&table, 1, created, now, 10.0, 60);
        assert_eq!(decision, LifecycleDecision::Finish);
    }

    #[test]
    fn resolve_falls_back_to_first_real_phase() {
        let table = two_phase_table();
        assert_eq!(table.resolve(7).unwrap().id, 1);
        assert_eq!(table.resolve(2).unwrap().id, 2);
        assert!(PhaseTable::default().resolve(1).is_none());
    }
}
