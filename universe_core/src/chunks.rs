use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::{Coord, DiscoveredBody};

/// Square region of coordinate space.
///
/// Footprints used by the cache are power-of-two sided and corner-aligned
/// to their own side length, so a footprint of side `2s` is exactly the
/// union of its four side-`s` quadrants. Determinism invariant: deriving
/// the same footprint twice with the same formula constants yields the
/// same entity set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct Footprint {
    pub bottom_left: Coord,
    pub side: u32,
}

impl Footprint {
    pub fn new(bottom_left: Coord, side: u32) -> Self {
        Self { bottom_left, side }
    }

    /// The aligned footprint of side `side` containing `coord`.
    pub fn aligned(coord: Coord, side: u32) -> Self {
        let s = side as i64;
        Self {
            bottom_left: Coord::new(coord.x.div_euclid(s) * s, coord.y.div_euclid(s) * s),
            side,
        }
    }

    pub fn is_aligned(&self) -> bool {
        let s = self.side as i64;
        s > 0
            && self.side.is_power_of_two()
            && self.bottom_left.x.rem_euclid(s) == 0
            && self.bottom_left.y.rem_euclid(s) == 0
    }

    pub fn contains(&self, coord: Coord) -> bool {
        let s = self.side as i64;
        coord.x >= self.bottom_left.x
            && coord.x < self.bottom_left.x + s
            && coord.y >= self.bottom_left.y
            && coord.y < self.bottom_left.y + s
    }

    pub fn contains_footprint(&self, other: &Footprint) -> bool {
        let s = self.side as i64;
        let o = other.side as i64;
        other.bottom_left.x >= self.bottom_left.x
            && other.bottom_left.x + o <= self.bottom_left.x + s
            && other.bottom_left.y >= self.bottom_left.y
            && other.bottom_left.y + o <= self.bottom_left.y + s
    }

    pub fn intersects(&self, other: &Footprint) -> bool {
        let s = self.side as i64;
        let o = other.side as i64;
        self.bottom_left.x < other.bottom_left.x + o
            && other.bottom_left.x < self.bottom_left.x + s
            && self.bottom_left.y < other.bottom_left.y + o
            && other.bottom_left.y < self.bottom_left.y + s
    }

    pub fn center(&self) -> Coord {
        let half = (self.side / 2) as i64;
        Coord::new(self.bottom_left.x + half, self.bottom_left.y + half)
    }

    /// Four aligned quadrants, or `None` for a unit footprint.
    pub fn quadrants(&self) -> Option<[Footprint; 4]> {
        if self.side < 2 {
            return None;
        }
        let half = self.side / 2;
        let h = half as i64;
        let Coord { x, y } = self.bottom_left;
        Some([
            Footprint::new(Coord::new(x, y), half),
            Footprint::new(Coord::new(x + h, y), half),
            Footprint::new(Coord::new(x, y + h), half),
            Footprint::new(Coord::new(x + h, y + h), half),
        ])
    }

    /// The aligned footprint of twice this side containing this one.
    pub fn parent(&self) -> Footprint {
        Footprint::aligned(self.bottom_left, self.side * 2)
    }

    /// Aligned tiles of side `tile_side` whose union covers this
    /// footprint. The cover may extend past an unaligned request.
    pub fn covering_tiles(&self, tile_side: u32) -> Vec<Footprint> {
        let s = tile_side as i64;
        let x0 = self.bottom_left.x.div_euclid(s) * s;
        let y0 = self.bottom_left.y.div_euclid(s) * s;
        let x_end = self.bottom_left.x + self.side as i64;
        let y_end = self.bottom_left.y + self.side as i64;

        let mut tiles = Vec::new();
        let mut y = y0;
        while y < y_end {
            let mut x = x0;
            while x < x_end {
                tiles.push(Footprint::new(Coord::new(x, y), tile_side));
                x += s;
            }
            y += s;
        }
        tiles
    }

    /// Every coordinate inside the footprint, row-major.
    pub fn coords(&self) -> impl Iterator<Item = Coord> + '_ {
        let s = self.side as i64;
        let Coord { x, y } = self.bottom_left;
        (0..s).flat_map(move |dy| (0..s).map(move |dx| Coord::new(x + dx, y + dy)))
    }

    pub fn area(&self) -> u64 {
        self.side as u64 * self.side as u64
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.bottom_left, self.side)
    }
}

/// A generated region: its footprint, the bodies discovered inside it and
/// an approximate density metric (zone noise at the footprint center).
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Chunk {
    pub footprint: Footprint,
    pub bodies: Vec<DiscoveredBody>,
    pub density: u8,
    pub digest: u64,
}

impl Chunk {
    /// Build a chunk with canonical body order and content digest.
    pub fn assemble(footprint: Footprint, mut bodies: Vec<DiscoveredBody>, density: u8) -> Self {
        bodies.sort_unstable_by_key(|body| body.location.coord);
        let digest = ledger_proto::digest_of(&bodies);
        Self {
            footprint,
            bodies,
            density,
            digest,
        }
    }

    /// Merge four sibling quadrant chunks into their parent.
    ///
    /// Deterministic given deterministic inputs, so two clients always
    /// consolidate to identical parents.
    pub fn merge(parent: Footprint, quadrants: [&Chunk; 4]) -> Self {
        debug_assert!(quadrants
            .iter()
            .all(|chunk| parent.contains_footprint(&chunk.footprint)));
        let mut bodies = Vec::new();
        let mut density_sum = 0u32;
        for chunk in quadrants {
            bodies.extend(chunk.bodies.iter().copied());
            density_sum += chunk.density as u32;
        }
        Self::assemble(parent, bodies, (density_sum / 4) as u8)
    }

    pub fn bodies_within<'a>(
        &'a self,
        footprint: &'a Footprint,
    ) -> impl Iterator<Item = &'a DiscoveredBody> + 'a {
        self.bodies
            .iter()
            .filter(move |body| footprint.contains(body.location.coord))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_snaps_negative_coordinates_down() {
        let footprint = Footprint::aligned(Coord::new(-1, -1), 16);
        assert_eq!(footprint.bottom_left, Coord::new(-16, -16));
        assert!(footprint.is_aligned());
        assert!(footprint.contains(Coord::new(-1, -1)));
    }

    #[test]
    fn quadrants_tile_the_parent_exactly() {
        let parent = Footprint::new(Coord::new(-32, 32), 32);
        let quadrants = parent.quadrants().expect("side 32 splits");
        let area: u64 = quadrants.iter().map(Footprint::area).sum();
        assert_eq!(area, parent.area());
        for quadrant in &quadrants {
            assert!(parent.contains_footprint(quadrant));
            assert!(quadrant.is_aligned());
            assert_eq!(quadrant.parent(), parent);
        }
    }

    #[test]
    fn covering_tiles_cover_unaligned_requests() {
        let request = Footprint::new(Coord::new(-5, 3), 20);
        let tiles = request.covering_tiles(16);
        assert_eq!(tiles.len(), 4);
        for coord in request.coords() {
            assert!(tiles.iter().any(|tile| tile.contains(coord)));
        }
    }

    #[test]
    fn intersection_is_symmetric_and_strict() {
        let a = Footprint::new(Coord::new(0, 0), 16);
        let b = Footprint::new(Coord::new(16, 0), 16);
        let c = Footprint::new(Coord::new(8, 8), 16);
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
        assert!(a.intersects(&c));
        assert!(c.intersects(&b));
    }

    #[test]
    fn assemble_orders_bodies_canonically() {
        use crate::constants::FormulaConstants;
        use crate::oracle::Oracle;
        use std::sync::Arc;

        let oracle = Oracle::new(Arc::new(FormulaConstants::builtin()));
        let footprint = Footprint::new(Coord::new(0, 0), 64);
        let mut bodies: Vec<_> = footprint.coords().filter_map(|c| oracle.body_at(c)).collect();
        bodies.reverse();
        let reversed = Chunk::assemble(footprint, bodies.clone(), 10);
        bodies.reverse();
        let ordered = Chunk::assemble(footprint, bodies, 10);
        assert_eq!(reversed, ordered);
        assert_eq!(reversed.digest, ordered.digest);
    }
}
