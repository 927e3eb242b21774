use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use ledger_proto::{Address, DynamicState, EntityId};

use crate::constants::FormulaConstants;
use crate::scalar::Scalar;

/// Signed universe coordinate. The universe is unbounded; coordinates are
/// never stored on the ledger, only their hashes.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct Coord {
    pub x: i64,
    pub y: i64,
}

impl Coord {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Squared euclidean distance, wide enough for any coordinate pair.
    pub fn dist2(self, other: Coord) -> i128 {
        let dx = self.x as i128 - other.x as i128;
        let dy = self.y as i128 - other.y as i128;
        dx * dx + dy * dy
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Zone classification of a coordinate, derived from the zone noise field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum SpaceZone {
    Nebula,
    Space,
    DeepSpace,
}

impl SpaceZone {
    pub fn as_u8(self) -> u8 {
        match self {
            SpaceZone::Nebula => 0,
            SpaceZone::Space => 1,
            SpaceZone::DeepSpace => 2,
        }
    }

    pub fn from_u8(value: u8) -> SpaceZone {
        match value {
            1 => SpaceZone::Space,
            2 => SpaceZone::DeepSpace,
            _ => SpaceZone::Nebula,
        }
    }
}

impl fmt::Display for SpaceZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpaceZone::Nebula => "nebula",
            SpaceZone::Space => "space",
            SpaceZone::DeepSpace => "deep space",
        };
        write!(f, "{}", name)
    }
}

/// Rarity tier of a body, 0 (common) through 7 (rarest).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct RarityTier(pub u8);

impl RarityTier {
    pub const MIN: RarityTier = RarityTier(0);
    pub const MAX: RarityTier = RarityTier(7);

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RarityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.0)
    }
}

bitflags! {
    /// Hash-derived stat bonuses. Each flag doubles the corresponding
    /// base stat.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
    pub struct BonusFlags: u8 {
        const ENERGY_CAP = 1 << 0;
        const ENERGY_GROWTH = 1 << 1;
        const RANGE = 1 << 2;
        const SPEED = 1 << 3;
        const DEFENSE = 1 << 4;
    }
}

/// Base capacities and rates of a body after tier, zone and bonus
/// adjustments.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct BodyStats {
    pub energy_cap: Scalar,
    pub energy_growth: Scalar,
    pub silver_cap: Scalar,
    pub silver_growth: Scalar,
    pub range: u32,
    pub speed: u32,
    pub defense: u32,
}

/// Attributes fixed forever at generation time. A body's static attributes
/// are a pure function of its coordinate and the formula constants; they
/// are never mutated and never re-derived differently.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct StaticAttributes {
    pub coord: Coord,
    pub tier: RarityTier,
    pub zone: SpaceZone,
    pub bonus: BonusFlags,
    pub silver_bearing: bool,
    pub stats: BodyStats,
}

impl StaticAttributes {
    /// Dynamic state of a body that has never been touched by the ledger:
    /// unowned, at the genesis fraction of its energy cap.
    pub fn genesis_dynamic(&self, constants: &FormulaConstants) -> DynamicState {
        let energy = self
            .stats
            .energy_cap
            .mul_ratio(constants.genesis_energy_pct as i64, 100);
        DynamicState {
            owner: Address::ZERO,
            energy: energy.raw(),
            silver: 0,
            locked_until: 0,
            updated_at: 0,
        }
    }
}

/// Static attributes of an in-flight transfer. Voyages are minted by the
/// ledger and never derived procedurally.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VoyageStatics {
    pub player: Address,
    pub from: EntityId,
    pub to: EntityId,
    pub energy: Scalar,
    pub silver: Scalar,
    pub departure_time: u64,
    pub arrival_time: u64,
}

impl VoyageStatics {
    /// Fraction of the voyage completed at `now`, in `[0, 1]`.
    pub fn progress(&self, now: u64) -> Scalar {
        if now <= self.departure_time {
            return Scalar::zero();
        }
        if now >= self.arrival_time || self.arrival_time <= self.departure_time {
            return Scalar::one();
        }
        let elapsed = (now - self.departure_time) as i64;
        let total = (self.arrival_time - self.departure_time) as i64;
        Scalar::one().mul_ratio(elapsed, total)
    }
}

/// Kind-specific static payload of an entity.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum EntityClass {
    Body(StaticAttributes),
    Voyage(VoyageStatics),
}

impl EntityClass {
    pub fn as_body(&self) -> Option<&StaticAttributes> {
        match self {
            EntityClass::Body(statics) => Some(statics),
            EntityClass::Voyage(_) => None,
        }
    }

    pub fn as_voyage(&self) -> Option<&VoyageStatics> {
        match self {
            EntityClass::Voyage(voyage) => Some(voyage),
            EntityClass::Body(_) => None,
        }
    }
}

/// Where a body sits and what the noise fields said there.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct BodyLocation {
    pub coord: Coord,
    pub id: EntityId,
    pub zone_noise: u8,
    pub biome_noise: u8,
}

/// A body surfaced by chunk generation: its location plus fully derived
/// static attributes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DiscoveredBody {
    pub location: BodyLocation,
    pub statics: StaticAttributes,
}

/// Current dynamic attributes as materialized by the projector.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct ProjectedResources {
    pub energy: Scalar,
    pub silver: Scalar,
    pub lockup_remaining: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_conversion_roundtrips() {
        for zone in [SpaceZone::Nebula, SpaceZone::Space, SpaceZone::DeepSpace] {
            assert_eq!(SpaceZone::from_u8(zone.as_u8()), zone);
        }
        assert_eq!(SpaceZone::from_u8(200), SpaceZone::Nebula);
    }

    #[test]
    fn voyage_progress_clamps_to_unit_interval() {
        let voyage = VoyageStatics {
            player: Address::ZERO,
            from: EntityId::default(),
            to: EntityId::default(),
            energy: Scalar::from_i64(50),
            silver: Scalar::zero(),
            departure_time: 100,
            arrival_time: 200,
        };
        assert_eq!(voyage.progress(50), Scalar::zero());
        assert_eq!(voyage.progress(150), Scalar::from_f32(0.5));
        assert_eq!(voyage.progress(400), Scalar::one());
    }

    #[test]
    fn coordinate_distance_is_symmetric() {
        let a = Coord::new(-3, 4);
        let b = Coord::new(9, -1);
        assert_eq!(a.dist2(b), b.dist2(a));
        assert_eq!(a.dist2(a), 0);
    }
}
