//! On-demand materialization of dynamic attributes from a confirmed
//! snapshot plus elapsed wall-clock time.
//!
//! Every read is O(1) no matter how long an entity went unobserved. The
//! arithmetic is pure fixed-point so any two clients (and the ledger)
//! compute bit-identical values from the same snapshot.

use ledger_proto::DynamicState;

use crate::constants::FormulaConstants;
use crate::entity::{BodyStats, ProjectedResources, StaticAttributes};
use crate::scalar::Scalar;

const MICRO: i128 = Scalar::SCALE as i128;

/// `e^-1` in micro units.
const INV_E: i128 = 367_879;

/// `e^-x` for non-negative fixed-point `x`.
///
/// Taylor series on the fractional part, repeated `e^-1` multiplication
/// for the integral part. Integer-only; monotone decreasing in `x`.
fn exp_neg(x: Scalar) -> Scalar {
    debug_assert!(x.raw() >= 0);
    let whole = x.raw() / Scalar::SCALE;
    if whole >= 42 {
        // Underflows micro precision.
        return Scalar::zero();
    }
    let fraction = (x.raw() % Scalar::SCALE) as i128;

    let mut term: i128 = MICRO;
    let mut sum: i128 = MICRO;
    for k in 1..=12i128 {
        term = term * fraction / (MICRO * k);
        if term == 0 {
            break;
        }
        if k % 2 == 1 {
            sum -= term;
        } else {
            sum += term;
        }
    }

    let mut result = sum;
    for _ in 0..whole {
        result = result * INV_E / MICRO;
    }
    Scalar::from_raw(result as i64)
}

/// Logistic approach toward the energy cap.
///
/// `E(t) = C / (1 + ((C - E0) / E0) * e^(-4 G dt / C))`, evaluated in
/// micro units with i128 intermediates. Handles snapshots above the cap
/// (decay toward it) as well as below. The result is clamped into the
/// interval between `E0` and `C`, which also pins down monotonicity under
/// integer rounding.
fn energy_after(stats: &BodyStats, energy0: Scalar, dt_game_micros: i128) -> Scalar {
    let cap = stats.energy_cap;
    let growth = stats.energy_growth;
    if energy0.is_zero() || growth.is_zero() || cap.is_zero() || energy0 == cap {
        return energy0;
    }

    let exponent_raw = 4 * growth.raw() as i128 * dt_game_micros / cap.raw() as i128;
    let exponent = Scalar::from_raw(exponent_raw.min(100 * MICRO) as i64);
    let decay = exp_neg(exponent).raw() as i128;

    let ratio = (cap.raw() as i128 - energy0.raw() as i128) * MICRO / energy0.raw() as i128;
    let denominator = MICRO + ratio * decay / MICRO;
    if denominator <= 0 {
        return cap;
    }
    let projected = cap.raw() as i128 * MICRO / denominator;

    let low = energy0.min(cap);
    let high = energy0.max(cap);
    Scalar::from_raw(projected.clamp(low.raw() as i128, high.raw() as i128) as i64)
}

/// Linear approach toward the silver cap.
fn silver_after(stats: &BodyStats, silver0: Scalar, dt_game_micros: i128) -> Scalar {
    let earned = stats.silver_growth.raw() as i128 * dt_game_micros / MICRO;
    let total = (silver0.raw() as i128 + earned).min(stats.silver_cap.raw() as i128);
    Scalar::from_raw(total.max(silver0.raw() as i128) as i64)
}

/// Project a body's dynamic attributes from its last confirmed snapshot to
/// `now`.
///
/// If `now` precedes the snapshot (clock skew) the snapshot values are
/// returned unchanged; the projection never runs backwards. Unowned bodies
/// do not grow.
pub fn project(
    statics: &StaticAttributes,
    snapshot: &DynamicState,
    now: u64,
    constants: &FormulaConstants,
) -> ProjectedResources {
    let energy0 = Scalar::from_raw(snapshot.energy);
    let silver0 = Scalar::from_raw(snapshot.silver);
    let lockup_remaining = snapshot.locked_until.saturating_sub(now);

    if now <= snapshot.updated_at || snapshot.owner.is_zero() {
        return ProjectedResources {
            energy: energy0,
            silver: silver0,
            lockup_remaining,
        };
    }

    let dt = (now - snapshot.updated_at) as i128;
    let dt_game_micros = dt * constants.time_factor_hundredths as i128 * MICRO / 100;

    let energy = energy_after(&statics.stats, energy0, dt_game_micros);
    let silver = if statics.silver_bearing {
        silver_after(&statics.stats, silver0, dt_game_micros)
    } else {
        silver0
    };

    ProjectedResources {
        energy,
        silver,
        lockup_remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{BonusFlags, Coord, RarityTier, SpaceZone};
    use ledger_proto::Address;

    fn constants() -> FormulaConstants {
        FormulaConstants::builtin()
    }

    fn statics(tier: u8, silver_bearing: bool) -> StaticAttributes {
        let constants = constants();
        StaticAttributes {
            coord: Coord::new(0, 0),
            tier: RarityTier(tier),
            zone: SpaceZone::Nebula,
            bonus: BonusFlags::empty(),
            silver_bearing,
            stats: constants.body_stats(RarityTier(tier), SpaceZone::Nebula, BonusFlags::empty()),
        }
    }

    fn owned_snapshot(statics: &StaticAttributes, energy_pct: i64, at: u64) -> DynamicState {
        DynamicState {
            owner: Address([1u8; 20]),
            energy: statics.stats.energy_cap.mul_ratio(energy_pct, 100).raw(),
            silver: 0,
            locked_until: 0,
            updated_at: at,
        }
    }

    #[test]
    fn exp_neg_matches_reference_points() {
        assert_eq!(exp_neg(Scalar::zero()), Scalar::one());
        let e1 = exp_neg(Scalar::from_i64(1)).raw();
        assert!((e1 - 367_879).abs() <= 2, "e^-1 ~ {}", e1);
        let e2 = exp_neg(Scalar::from_i64(2)).raw();
        assert!((e2 - 135_335).abs() <= 4, "e^-2 ~ {}", e2);
        assert_eq!(exp_neg(Scalar::from_i64(50)), Scalar::zero());
    }

    #[test]
    fn exp_neg_is_monotone_decreasing() {
        let mut previous = Scalar::one();
        for step in 1..200 {
            let value = exp_neg(Scalar::from_raw(step * 50_000));
            assert!(value <= previous);
            previous = value;
        }
    }

    #[test]
    fn clock_skew_clamps_to_snapshot() {
        let statics = statics(2, false);
        let snapshot = owned_snapshot(&statics, 50, 1_000);
        let projected = project(&statics, &snapshot, 500, &constants());
        assert_eq!(projected.energy.raw(), snapshot.energy);
        assert_eq!(projected.silver.raw(), snapshot.silver);
    }

    #[test]
    fn unowned_bodies_do_not_grow() {
        let statics = statics(2, true);
        let mut snapshot = owned_snapshot(&statics, 25, 0);
        snapshot.owner = Address::ZERO;
        let projected = project(&statics, &snapshot, 100_000, &constants());
        assert_eq!(projected.energy.raw(), snapshot.energy);
        assert_eq!(projected.silver.raw(), snapshot.silver);
    }

    #[test]
    fn energy_growth_is_monotone_and_capped() {
        let constants = constants();
        let statics = statics(3, false);
        let snapshot = owned_snapshot(&statics, 10, 0);
        let mut previous = Scalar::from_raw(snapshot.energy);
        for t in (0..500_000u64).step_by(5_000) {
            let projected = project(&statics, &snapshot, t, &constants);
            assert!(projected.energy >= previous, "dip at t={}", t);
            assert!(projected.energy <= statics.stats.energy_cap);
            previous = projected.energy;
        }
        let late = project(&statics, &snapshot, 10_000_000, &constants);
        assert_eq!(late.energy, statics.stats.energy_cap);
    }

    #[test]
    fn energy_above_cap_decays_toward_cap() {
        let constants = constants();
        let statics = statics(3, false);
        let mut snapshot = owned_snapshot(&statics, 100, 0);
        snapshot.energy = statics.stats.energy_cap.mul_ratio(3, 2).raw();
        let mut previous = Scalar::from_raw(snapshot.energy);
        for t in (0..200_000u64).step_by(4_000) {
            let projected = project(&statics, &snapshot, t, &constants);
            assert!(projected.energy <= previous, "rise at t={}", t);
            assert!(projected.energy >= statics.stats.energy_cap);
            previous = projected.energy;
        }
    }

    #[test]
    fn logistic_matches_float_reference_at_midpoint() {
        let constants = constants();
        let statics = statics(4, false);
        let snapshot = owned_snapshot(&statics, 20, 0);
        // Six real seconds of game time puts the exponent near 1, well
        // away from both the linear regime and saturation.
        let now = 6;

        let cap = statics.stats.energy_cap.to_f32() as f64;
        let growth = statics.stats.energy_growth.to_f32() as f64;
        let e0 = Scalar::from_raw(snapshot.energy).to_f32() as f64;
        let dt = now as f64 * constants.time_factor_hundredths as f64 / 100.0;
        let reference = cap / (1.0 + ((cap - e0) / e0) * (-4.0 * growth * dt / cap).exp());

        let projected = project(&statics, &snapshot, now, &constants);
        let got = projected.energy.to_f32() as f64;
        let error = (got - reference).abs() / reference;
        assert!(error < 0.001, "got {}, reference {}", got, reference);
    }

    #[test]
    fn silver_grows_linearly_to_cap() {
        let constants = constants();
        let statics = statics(3, true);
        let snapshot = owned_snapshot(&statics, 50, 0);

        // One game-second of growth, scaled by the time factor.
        let after_one = project(&statics, &snapshot, 1, &constants);
        let expected = statics
            .stats
            .silver_growth
            .mul_ratio(constants.time_factor_hundredths as i64, 100);
        assert_eq!(after_one.silver, expected);

        let late = project(&statics, &snapshot, 100_000_000, &constants);
        assert_eq!(late.silver, statics.stats.silver_cap);
    }

    #[test]
    fn non_silver_bodies_accrue_nothing() {
        let constants = constants();
        let statics = statics(3, false);
        let snapshot = owned_snapshot(&statics, 50, 0);
        let projected = project(&statics, &snapshot, 50_000, &constants);
        assert_eq!(projected.silver, Scalar::zero());
    }

    #[test]
    fn lockup_counts_down_and_expires() {
        let constants = constants();
        let statics = statics(2, false);
        let mut snapshot = owned_snapshot(&statics, 50, 0);
        snapshot.locked_until = 1_000;
        assert_eq!(project(&statics, &snapshot, 400, &constants).lockup_remaining, 600);
        assert_eq!(project(&statics, &snapshot, 1_000, &constants).lockup_remaining, 0);
        assert_eq!(project(&statics, &snapshot, 2_000, &constants).lockup_remaining, 0);
    }
}
