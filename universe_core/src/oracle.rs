use std::sync::Arc;

use ledger_proto::EntityId;

use crate::constants::FormulaConstants;
use crate::entity::{BodyLocation, Coord, DiscoveredBody, SpaceZone, StaticAttributes};
use crate::hashing::MimcSponge;

/// Independent noise channels derived from the noise sponge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NoiseChannel {
    Zone,
    Biome,
}

impl NoiseChannel {
    fn tag(self) -> i64 {
        match self {
            NoiseChannel::Zone => 0,
            NoiseChannel::Biome => 1,
        }
    }
}

/// Raw pseudo-random fields for one coordinate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CoordinateDerivation {
    pub id: EntityId,
    pub existence_roll: u64,
    pub exists: bool,
    pub tier_roll: u32,
    pub silver_roll: u16,
    pub bonus_rolls: [u8; 5],
    pub zone_noise: u8,
    pub biome_noise: u8,
    pub zone: SpaceZone,
}

/// Pure function from coordinate to pseudo-random fields.
///
/// Everything here must match the ledger's verification circuit exactly;
/// see the interval conventions on [`FormulaConstants`].
#[derive(Debug, Clone)]
pub struct Oracle {
    sponge: MimcSponge,
    noise_sponge: MimcSponge,
    constants: Arc<FormulaConstants>,
}

/// Noise octave cell sizes, coarsest first.
const NOISE_SCALES: [i64; 3] = [4096, 1024, 256];
/// Blend weights per octave; denominator is their sum.
const NOISE_WEIGHTS: [i64; 3] = [2, 1, 1];

impl Oracle {
    pub fn new(constants: Arc<FormulaConstants>) -> Self {
        Self {
            sponge: MimcSponge::new(&constants.hash_seed),
            noise_sponge: MimcSponge::new(&constants.noise_seed),
            constants,
        }
    }

    pub fn constants(&self) -> &FormulaConstants {
        &self.constants
    }

    /// Derive every pseudo-random field at `coord`, including the noise
    /// channels. Deterministic: two calls always agree.
    pub fn derive_at(&self, coord: Coord) -> CoordinateDerivation {
        let words = self.sponge.digest4(&[coord.x, coord.y]);
        let zone_noise = self.noise_at(coord, NoiseChannel::Zone);
        CoordinateDerivation {
            id: EntityId::from_words(words),
            existence_roll: words[0],
            exists: words[0] < self.constants.existence_threshold(),
            tier_roll: (words[1] & 0xff_ffff) as u32,
            silver_roll: ((words[1] >> 24) & 0xffff) as u16,
            bonus_rolls: [
                (words[2] & 0xff) as u8,
                ((words[2] >> 8) & 0xff) as u8,
                ((words[2] >> 16) & 0xff) as u8,
                ((words[2] >> 24) & 0xff) as u8,
                ((words[2] >> 32) & 0xff) as u8,
            ],
            zone_noise,
            biome_noise: self.noise_at(coord, NoiseChannel::Biome),
            zone: self.constants.zone_of(zone_noise),
        }
    }

    /// The body at `coord`, if one exists.
    ///
    /// The existence test runs on the sponge words alone so that mining a
    /// mostly-empty tile never pays for the noise lattice.
    pub fn body_at(&self, coord: Coord) -> Option<DiscoveredBody> {
        let words = self.sponge.digest4(&[coord.x, coord.y]);
        if words[0] >= self.constants.existence_threshold() {
            return None;
        }
        let derivation = self.derive_at(coord);
        Some(self.body_from_derivation(&derivation, coord))
    }

    fn body_from_derivation(
        &self,
        derivation: &CoordinateDerivation,
        coord: Coord,
    ) -> DiscoveredBody {
        let tier = self
            .constants
            .tier_for_roll(derivation.tier_roll, derivation.zone);
        let bonus = self.constants.bonus_from_rolls(derivation.bonus_rolls);
        let silver_bearing =
            self.constants
                .silver_bearing(tier, derivation.zone, derivation.silver_roll);
        let stats = self.constants.body_stats(tier, derivation.zone, bonus);
        DiscoveredBody {
            location: BodyLocation {
                coord,
                id: derivation.id,
                zone_noise: derivation.zone_noise,
                biome_noise: derivation.biome_noise,
            },
            statics: StaticAttributes {
                coord,
                tier,
                zone: derivation.zone,
                bonus,
                silver_bearing,
                stats,
            },
        }
    }

    /// Multi-octave integer lattice noise in `0..=32`.
    ///
    /// Corner values come from the noise sponge, bilinearly interpolated
    /// with integer weights so every client computes the identical value.
    pub fn noise_at(&self, coord: Coord, channel: NoiseChannel) -> u8 {
        let mut acc: i64 = 0;
        let weight_sum: i64 = NOISE_WEIGHTS.iter().sum();
        for (scale, weight) in NOISE_SCALES.into_iter().zip(NOISE_WEIGHTS) {
            acc += self.octave_at(coord, channel, scale) * weight;
        }
        (acc / weight_sum) as u8
    }

    fn octave_at(&self, coord: Coord, channel: NoiseChannel, scale: i64) -> i64 {
        let cx = coord.x.div_euclid(scale);
        let cy = coord.y.div_euclid(scale);
        let fx = coord.x.rem_euclid(scale);
        let fy = coord.y.rem_euclid(scale);

        let corner = |dx: i64, dy: i64| -> i64 {
            (self
                .noise_sponge
                .hash(&[cx + dx, cy + dy, channel.tag(), scale])
                % 33) as i64
        };

        let v00 = corner(0, 0);
        let v10 = corner(1, 0);
        let v01 = corner(0, 1);
        let v11 = corner(1, 1);

        let top = v00 * (scale - fx) + v10 * fx;
        let bottom = v01 * (scale - fx) + v11 * fx;
        (top * (scale - fy) + bottom * fy) / (scale * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn oracle() -> Oracle {
        Oracle::new(Arc::new(FormulaConstants::builtin()))
    }

    #[test]
    fn derivation_is_deterministic() {
        let oracle = oracle();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..64 {
            let coord = Coord::new(rng.gen_range(-100_000..100_000), rng.gen_range(-100_000..100_000));
            assert_eq!(oracle.derive_at(coord), oracle.derive_at(coord));
        }
    }

    #[test]
    fn two_oracles_from_same_constants_agree() {
        let constants = Arc::new(FormulaConstants::builtin());
        let a = Oracle::new(Arc::clone(&constants));
        let b = Oracle::new(constants);
        let coord = Coord::new(8_191, -44_002);
        assert_eq!(a.derive_at(coord), b.derive_at(coord));
        assert_eq!(a.body_at(coord), b.body_at(coord));
    }

    #[test]
    fn body_agrees_with_derivation_existence() {
        let oracle = oracle();
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        for _ in 0..256 {
            let coord = Coord::new(rng.gen_range(-50_000..50_000), rng.gen_range(-50_000..50_000));
            let derivation = oracle.derive_at(coord);
            assert_eq!(derivation.exists, oracle.body_at(coord).is_some());
        }
    }

    #[test]
    fn noise_stays_in_range() {
        let oracle = oracle();
        for x in -40i64..40 {
            for y in -40i64..40 {
                let coord = Coord::new(x * 97, y * 89);
                assert!(oracle.noise_at(coord, NoiseChannel::Zone) <= 32);
                assert!(oracle.noise_at(coord, NoiseChannel::Biome) <= 32);
            }
        }
    }

    #[test]
    fn noise_channels_are_independent() {
        let oracle = oracle();
        let mut differing = 0;
        for x in 0i64..64 {
            let coord = Coord::new(x * 31, x * 17);
            if oracle.noise_at(coord, NoiseChannel::Zone)
                != oracle.noise_at(coord, NoiseChannel::Biome)
            {
                differing += 1;
            }
        }
        assert!(differing > 0, "channels should not be identical fields");
    }

    #[test]
    fn derived_statics_respect_zone_cap() {
        let oracle = oracle();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut found = 0;
        while found < 8 {
            let coord = Coord::new(rng.gen_range(-200_000..200_000), rng.gen_range(-200_000..200_000));
            if let Some(body) = oracle.body_at(coord) {
                let cap = oracle.constants().tier_cap(body.statics.zone);
                assert!(body.statics.tier <= cap);
                found += 1;
            }
        }
    }
}
