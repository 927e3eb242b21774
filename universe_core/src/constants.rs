use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{BodyStats, BonusFlags, RarityTier, SpaceZone};
use crate::scalar::Scalar;

/// Constants shipped with the build. A game instance may override them at
/// startup via [`FormulaConstants::load_from_path`]; they are immutable for
/// the lifetime of the instance.
pub const BUILTIN_CONSTANTS: &str = include_str!("data/formula_constants.json");

/// Per-tier base stats, in whole resource units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub energy_cap: i64,
    pub energy_growth: i64,
    pub silver_cap: i64,
    pub silver_growth: i64,
    pub range: u32,
    pub speed: u32,
    pub defense: u32,
}

/// The formula constants agreed between client and ledger.
///
/// Interval conventions are load-bearing; an off-by-one on any of them
/// desyncs the client from the chain. The exact conventions:
///
/// - existence: a body exists iff `existence_roll < FIELD_PRIME /
///   planet_rarity` (strict less-than, open upper bound);
/// - zone: `noise < zone_threshold_low` is Nebula,
///   `zone_threshold_low <= noise < zone_threshold_high` is Space,
///   `noise >= zone_threshold_high` is DeepSpace;
/// - tier: the largest index `i` with `tier_roll < tier_thresholds[i]`
///   (strict less-than against a descending table; index 0 admits every
///   24-bit roll, so a body always has a tier);
/// - bonus: each bonus byte grants its flag iff `byte < bonus_threshold`
///   (strict less-than);
/// - silver: a body bears silver iff its tier is at least 1 and
///   `silver_roll % silver_rarity[zone] == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaConstants {
    /// Seed string for the coordinate sponge. Client and ledger circuit
    /// derive identical round constants from it.
    pub hash_seed: String,
    /// Seed string for the noise-field sponge, independent of `hash_seed`.
    pub noise_seed: String,
    pub planet_rarity: u64,
    pub zone_threshold_low: u8,
    pub zone_threshold_high: u8,
    /// Descending 24-bit thresholds, one per tier.
    pub tier_thresholds: [u32; 8],
    /// Maximum tier per zone, indexed by `SpaceZone::as_u8`.
    pub tier_caps: [u8; 3],
    /// Silver rarity divisor per zone, indexed by `SpaceZone::as_u8`.
    pub silver_rarity: [u16; 3],
    #[serde(default = "default_bonus_threshold")]
    pub bonus_threshold: u8,
    pub time_factor_hundredths: u32,
    pub lockup_duration_secs: u64,
    #[serde(default = "default_genesis_energy_pct")]
    pub genesis_energy_pct: u32,
    pub tier_stats: [TierStats; 8],
}

const fn default_bonus_threshold() -> u8 {
    16
}

const fn default_genesis_energy_pct() -> u32 {
    25
}

#[derive(Debug, Error)]
pub enum ConstantsError {
    #[error("failed to read formula constants: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse formula constants: {0}")]
    Parse(#[from] serde_json::Error),
}

impl FormulaConstants {
    /// The constants compiled into the build.
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_CONSTANTS).expect("builtin formula constants are valid")
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConstantsError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Existence threshold in the sponge field. Strict less-than.
    pub fn existence_threshold(&self) -> u64 {
        crate::hashing::FIELD_PRIME / self.planet_rarity
    }

    pub fn zone_of(&self, noise: u8) -> SpaceZone {
        if noise < self.zone_threshold_low {
            SpaceZone::Nebula
        } else if noise < self.zone_threshold_high {
            SpaceZone::Space
        } else {
            SpaceZone::DeepSpace
        }
    }

    pub fn tier_cap(&self, zone: SpaceZone) -> RarityTier {
        RarityTier(self.tier_caps[zone.as_u8() as usize].min(RarityTier::MAX.0))
    }

    /// Tier from a 24-bit roll: the largest index whose threshold still
    /// exceeds the roll, capped by the zone.
    pub fn tier_for_roll(&self, tier_roll: u32, zone: SpaceZone) -> RarityTier {
        let mut tier = RarityTier::MIN;
        for (index, &threshold) in self.tier_thresholds.iter().enumerate() {
            if tier_roll < threshold {
                tier = RarityTier(index as u8);
            }
        }
        tier.min(self.tier_cap(zone))
    }

    pub fn silver_bearing(&self, tier: RarityTier, zone: SpaceZone, silver_roll: u16) -> bool {
        if tier < RarityTier(1) {
            return false;
        }
        let divisor = self.silver_rarity[zone.as_u8() as usize];
        divisor != 0 && silver_roll % divisor == 0
    }

    pub fn bonus_from_rolls(&self, rolls: [u8; 5]) -> BonusFlags {
        let flags = [
            BonusFlags::ENERGY_CAP,
            BonusFlags::ENERGY_GROWTH,
            BonusFlags::RANGE,
            BonusFlags::SPEED,
            BonusFlags::DEFENSE,
        ];
        let mut bonus = BonusFlags::empty();
        for (roll, flag) in rolls.into_iter().zip(flags) {
            if roll < self.bonus_threshold {
                bonus |= flag;
            }
        }
        bonus
    }

    /// Fully adjusted stats for a body: tier base, zone modifier, bonus
    /// doubling. Zone modifiers follow the original game: Space raises the
    /// energy cap by a quarter, DeepSpace by half while halving defense.
    pub fn body_stats(&self, tier: RarityTier, zone: SpaceZone, bonus: BonusFlags) -> BodyStats {
        let base = &self.tier_stats[tier.as_usize()];
        let mut energy_cap = Scalar::from_i64(base.energy_cap);
        let mut energy_growth = Scalar::from_i64(base.energy_growth);
        let silver_cap = Scalar::from_i64(base.silver_cap);
        let silver_growth = Scalar::from_i64(base.silver_growth);
        let mut range = base.range;
        let mut speed = base.speed;
        let mut defense = base.defense;

        match zone {
            SpaceZone::Nebula => {}
            SpaceZone::Space => {
                energy_cap = energy_cap.mul_ratio(5, 4);
            }
            SpaceZone::DeepSpace => {
                energy_cap = energy_cap.mul_ratio(3, 2);
                defense /= 2;
            }
        }

        if bonus.contains(BonusFlags::ENERGY_CAP) {
            energy_cap = energy_cap.mul_ratio(2, 1);
        }
        if bonus.contains(BonusFlags::ENERGY_GROWTH) {
            energy_growth = energy_growth.mul_ratio(2, 1);
        }
        if bonus.contains(BonusFlags::RANGE) {
            range *= 2;
        }
        if bonus.contains(BonusFlags::SPEED) {
            speed *= 2;
        }
        if bonus.contains(BonusFlags::DEFENSE) {
            defense *= 2;
        }

        BodyStats {
            energy_cap,
            energy_growth,
            silver_cap,
            silver_growth,
            range,
            speed,
            defense,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_constants_parse() {
        let constants = FormulaConstants::builtin();
        assert_eq!(constants.planet_rarity, 6000);
        assert_eq!(constants.tier_thresholds[0], 1 << 24);
    }

    #[test]
    fn zone_thresholds_use_documented_convention() {
        let constants = FormulaConstants::builtin();
        assert_eq!(constants.zone_of(14), SpaceZone::Nebula);
        assert_eq!(constants.zone_of(15), SpaceZone::Space);
        assert_eq!(constants.zone_of(16), SpaceZone::Space);
        assert_eq!(constants.zone_of(17), SpaceZone::DeepSpace);
        assert_eq!(constants.zone_of(32), SpaceZone::DeepSpace);
    }

    #[test]
    fn tier_zero_always_admitted() {
        let constants = FormulaConstants::builtin();
        let tier = constants.tier_for_roll((1 << 24) - 1, SpaceZone::DeepSpace);
        assert_eq!(tier, RarityTier(0));
    }

    #[test]
    fn tier_boundary_is_strict() {
        let constants = FormulaConstants::builtin();
        // Exactly at the tier-7 threshold falls back to tier 6.
        assert_eq!(
            constants.tier_for_roll(960, SpaceZone::DeepSpace),
            RarityTier(6)
        );
        assert_eq!(
            constants.tier_for_roll(959, SpaceZone::DeepSpace),
            RarityTier(7)
        );
    }

    #[test]
    fn zone_caps_limit_tier() {
        let constants = FormulaConstants::builtin();
        assert_eq!(constants.tier_for_roll(0, SpaceZone::Nebula), RarityTier(3));
        assert_eq!(constants.tier_for_roll(0, SpaceZone::Space), RarityTier(4));
        assert_eq!(
            constants.tier_for_roll(0, SpaceZone::DeepSpace),
            RarityTier(7)
        );
    }

    #[test]
    fn silver_requires_tier_and_divisibility() {
        let constants = FormulaConstants::builtin();
        assert!(!constants.silver_bearing(RarityTier(0), SpaceZone::Nebula, 0));
        assert!(constants.silver_bearing(RarityTier(1), SpaceZone::Nebula, 16));
        assert!(!constants.silver_bearing(RarityTier(1), SpaceZone::Nebula, 17));
        assert!(constants.silver_bearing(RarityTier(1), SpaceZone::DeepSpace, 8));
    }

    #[test]
    fn deep_space_doubles_down_on_energy() {
        let constants = FormulaConstants::builtin();
        let nebula = constants.body_stats(RarityTier(2), SpaceZone::Nebula, BonusFlags::empty());
        let deep = constants.body_stats(RarityTier(2), SpaceZone::DeepSpace, BonusFlags::empty());
        assert_eq!(deep.energy_cap, nebula.energy_cap.mul_ratio(3, 2));
        assert_eq!(deep.defense, nebula.defense / 2);
    }

    #[test]
    fn bonus_flags_double_stats() {
        let constants = FormulaConstants::builtin();
        let plain = constants.body_stats(RarityTier(1), SpaceZone::Nebula, BonusFlags::empty());
        let boosted = constants.body_stats(
            RarityTier(1),
            SpaceZone::Nebula,
            BonusFlags::ENERGY_CAP | BonusFlags::SPEED,
        );
        assert_eq!(boosted.energy_cap, plain.energy_cap.mul_ratio(2, 1));
        assert_eq!(boosted.speed, plain.speed * 2);
        assert_eq!(boosted.defense, plain.defense);
    }
}
