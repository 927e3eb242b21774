use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::chunks::{Chunk, Footprint};
use crate::entity::{Coord, DiscoveredBody};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("chunk cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk cache codec: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Clone, Debug)]
struct StoredChunk {
    chunk: Chunk,
    last_access: u64,
}

/// On-disk form of the cache. The constants digest guards against loading
/// chunks generated under different formula constants; chunks for one game
/// instance are never valid for another.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    constants_digest: u64,
    chunks: Vec<Chunk>,
}

/// Store of previously generated chunks, keyed by footprint.
///
/// Lookups answer partial-coverage queries: a requested footprint counts
/// as covered when a single stored chunk encloses it or when all four of
/// its quadrants are (recursively) covered. Eviction is
/// least-recently-accessed, but chunks overlapping the current viewport
/// are never evicted.
pub struct ExploredChunkCache {
    chunks: HashMap<Footprint, StoredChunk>,
    clock: u64,
    capacity: usize,
    min_side: u32,
    max_side: u32,
    viewport: Option<Footprint>,
    constants_digest: u64,
}

impl ExploredChunkCache {
    pub fn new(capacity: usize, min_side: u32, max_side: u32, constants_digest: u64) -> Self {
        debug_assert!(min_side.is_power_of_two() && max_side.is_power_of_two());
        debug_assert!(min_side <= max_side);
        Self {
            chunks: HashMap::new(),
            clock: 0,
            capacity,
            min_side,
            max_side,
            viewport: None,
            constants_digest,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn set_viewport(&mut self, viewport: Footprint) {
        self.viewport = Some(viewport);
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert a chunk, last write wins.
    ///
    /// Two workers racing on the same footprint produce identical chunks
    /// (generation is deterministic), so overwriting is harmless. Complete
    /// sibling sets consolidate into their parent footprint up to the
    /// configured ceiling.
    pub fn store(&mut self, chunk: Chunk) {
        let now = self.tick();
        let mut footprint = chunk.footprint;
        self.chunks.insert(
            footprint,
            StoredChunk {
                chunk,
                last_access: now,
            },
        );

        while footprint.side < self.max_side {
            let parent = footprint.parent();
            let Some(quadrants) = parent.quadrants() else {
                break;
            };
            if !quadrants.iter().all(|q| self.chunks.contains_key(q)) {
                break;
            }
            let merged = Chunk::merge(
                parent,
                [
                    &self.chunks[&quadrants[0]].chunk,
                    &self.chunks[&quadrants[1]].chunk,
                    &self.chunks[&quadrants[2]].chunk,
                    &self.chunks[&quadrants[3]].chunk,
                ],
            );
            for quadrant in &quadrants {
                self.chunks.remove(quadrant);
            }
            debug!(
                target: "deepfield::cache",
                footprint = %parent,
                "consolidated sibling chunks"
            );
            self.chunks.insert(
                parent,
                StoredChunk {
                    chunk: merged,
                    last_access: now,
                },
            );
            footprint = parent;
        }

        self.evict_over_capacity();
    }

    fn evict_over_capacity(&mut self) {
        while self.chunks.len() > self.capacity {
            let viewport = self.viewport;
            let candidate = self
                .chunks
                .iter()
                .filter(|(footprint, _)| match viewport {
                    Some(viewport) => !footprint.intersects(&viewport),
                    None => true,
                })
                .min_by_key(|(_, stored)| stored.last_access)
                .map(|(footprint, _)| *footprint);
            match candidate {
                Some(footprint) => {
                    self.chunks.remove(&footprint);
                    debug!(target: "deepfield::cache", footprint = %footprint, "evicted chunk");
                }
                // Everything left overlaps the viewport; keep it all.
                None => break,
            }
        }
    }

    /// Footprints of stored chunks whose union covers `footprint`, or
    /// `None` if coverage is incomplete.
    fn coverage(&self, footprint: &Footprint) -> Option<Vec<Footprint>> {
        if self.chunks.contains_key(footprint) {
            return Some(vec![*footprint]);
        }
        // A larger stored chunk may enclose the request.
        let mut side = footprint.side.saturating_mul(2);
        while side <= self.max_side {
            let enclosing = Footprint::aligned(footprint.bottom_left, side);
            if enclosing.contains_footprint(footprint) && self.chunks.contains_key(&enclosing) {
                return Some(vec![enclosing]);
            }
            side = side.saturating_mul(2);
        }
        if footprint.side > self.min_side {
            let quadrants = footprint.quadrants()?;
            let mut parts = Vec::new();
            for quadrant in &quadrants {
                parts.extend(self.coverage(quadrant)?);
            }
            parts.dedup();
            return Some(parts);
        }
        None
    }

    /// Whether the footprint is fully covered by stored chunks.
    pub fn covers(&self, footprint: &Footprint) -> bool {
        self.coverage(footprint).is_some()
    }

    /// The stored chunks covering `footprint`, if coverage is complete.
    /// Bumps their access time.
    pub fn lookup(&mut self, footprint: &Footprint) -> Option<Vec<Chunk>> {
        let parts = self.coverage(footprint)?;
        let now = self.tick();
        let mut result = Vec::with_capacity(parts.len());
        for part in parts {
            let stored = self
                .chunks
                .get_mut(&part)
                .expect("coverage returned a missing footprint");
            stored.last_access = now;
            result.push(stored.chunk.clone());
        }
        Some(result)
    }

    /// All known bodies inside `footprint`, if it is fully covered.
    pub fn bodies_within(&mut self, footprint: &Footprint) -> Option<Vec<DiscoveredBody>> {
        let chunks = self.lookup(footprint)?;
        let mut bodies: Vec<DiscoveredBody> = chunks
            .iter()
            .flat_map(|chunk| chunk.bodies_within(footprint).copied().collect::<Vec<_>>())
            .collect();
        bodies.sort_unstable_by_key(|body| body.location.coord);
        bodies.dedup_by_key(|body| body.location.coord);
        Some(bodies)
    }

    /// Drop every chunk containing `coord`. Used when a confirmed ledger
    /// value disproves a locally derived attribute; the region must be
    /// re-derived from scratch.
    pub fn purge_containing(&mut self, coord: Coord) -> usize {
        let stale: Vec<Footprint> = self
            .chunks
            .keys()
            .filter(|footprint| footprint.contains(coord))
            .copied()
            .collect();
        for footprint in &stale {
            self.chunks.remove(footprint);
        }
        if !stale.is_empty() {
            warn!(
                target: "deepfield::cache",
                coord = %coord,
                purged = stale.len(),
                "purged chunks after derivation mismatch"
            );
        }
        stale.len()
    }

    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let persisted = PersistedCache {
            constants_digest: self.constants_digest,
            chunks: self
                .chunks
                .values()
                .map(|stored| stored.chunk.clone())
                .collect(),
        };
        let encoded = bincode::serialize(&persisted)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Load previously explored chunks from disk. A digest mismatch (file
    /// written under different formula constants) discards the file
    /// rather than serving chunks that can no longer be trusted.
    pub fn load(&mut self, path: &Path) -> Result<usize, CacheError> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read(path)?;
        let persisted: PersistedCache = bincode::deserialize(&raw)?;
        if persisted.constants_digest != self.constants_digest {
            warn!(
                target: "deepfield::cache",
                "discarding persisted chunks generated under different constants"
            );
            return Ok(0);
        }
        let count = persisted.chunks.len();
        for chunk in persisted.chunks {
            let now = self.tick();
            self.chunks.insert(
                chunk.footprint,
                StoredChunk {
                    chunk,
                    last_access: now,
                },
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FormulaConstants;
    use crate::oracle::Oracle;
    use std::sync::Arc;

    fn derive_chunk(oracle: &Oracle, footprint: Footprint) -> Chunk {
        let bodies = footprint.coords().filter_map(|c| oracle.body_at(c)).collect();
        Chunk::assemble(footprint, bodies, 10)
    }

    fn oracle() -> Oracle {
        Oracle::new(Arc::new(FormulaConstants::builtin()))
    }

    #[test]
    fn exact_footprint_roundtrips() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(64, 16, 256, 1);
        let footprint = Footprint::new(Coord::new(0, 0), 16);
        let chunk = derive_chunk(&oracle, footprint);
        cache.store(chunk.clone());
        let found = cache.lookup(&footprint).expect("covered");
        assert_eq!(found, vec![chunk]);
    }

    #[test]
    fn union_of_quadrants_covers_parent() {
        let oracle = oracle();
        // max_side equal to tile side disables consolidation so the
        // union path is what answers the query.
        let mut cache = ExploredChunkCache::new(64, 16, 16, 1);
        let parent = Footprint::new(Coord::new(0, 0), 32);
        for quadrant in parent.quadrants().expect("splits") {
            cache.store(derive_chunk(&oracle, quadrant));
        }
        assert!(cache.covers(&parent));
        let bodies = cache.bodies_within(&parent).expect("covered");
        let direct: Vec<_> = parent.coords().filter_map(|c| oracle.body_at(c)).collect();
        assert_eq!(bodies, direct);
    }

    #[test]
    fn coverage_equivalent_to_fresh_derivation() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(64, 16, 256, 1);
        for x in 0..2 {
            for y in 0..2 {
                let footprint = Footprint::new(Coord::new(x * 16, y * 16), 16);
                cache.store(derive_chunk(&oracle, footprint));
            }
        }
        // Consolidation should have produced the 32-side parent.
        let parent = Footprint::new(Coord::new(0, 0), 32);
        let bodies = cache.bodies_within(&parent).expect("covered");
        let direct: Vec<_> = parent.coords().filter_map(|c| oracle.body_at(c)).collect();
        assert_eq!(bodies, direct);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn larger_stored_chunk_answers_smaller_query() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(64, 16, 256, 1);
        let big = Footprint::new(Coord::new(0, 0), 64);
        cache.store(derive_chunk(&oracle, big));
        let small = Footprint::new(Coord::new(16, 32), 16);
        assert!(cache.covers(&small));
        let bodies = cache.bodies_within(&small).expect("covered");
        for body in &bodies {
            assert!(small.contains(body.location.coord));
        }
    }

    #[test]
    fn missing_quadrant_fails_coverage() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(64, 16, 16, 1);
        let parent = Footprint::new(Coord::new(0, 0), 32);
        let quadrants = parent.quadrants().expect("splits");
        for quadrant in &quadrants[..3] {
            cache.store(derive_chunk(&oracle, *quadrant));
        }
        assert!(!cache.covers(&parent));
    }

    #[test]
    fn eviction_skips_viewport_chunks() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(2, 16, 16, 1);
        let in_view = Footprint::new(Coord::new(0, 0), 16);
        let out_a = Footprint::new(Coord::new(512, 512), 16);
        let out_b = Footprint::new(Coord::new(1024, 1024), 16);
        cache.set_viewport(Footprint::new(Coord::new(0, 0), 64));

        cache.store(derive_chunk(&oracle, in_view));
        cache.store(derive_chunk(&oracle, out_a));
        cache.store(derive_chunk(&oracle, out_b));

        assert_eq!(cache.len(), 2);
        assert!(cache.covers(&in_view), "viewport chunk must survive");
        assert!(!cache.covers(&out_a), "oldest non-viewport chunk evicted");
        assert!(cache.covers(&out_b));
    }

    #[test]
    fn purge_drops_only_containing_chunks() {
        let oracle = oracle();
        let mut cache = ExploredChunkCache::new(64, 16, 16, 1);
        let a = Footprint::new(Coord::new(0, 0), 16);
        let b = Footprint::new(Coord::new(64, 64), 16);
        cache.store(derive_chunk(&oracle, a));
        cache.store(derive_chunk(&oracle, b));
        assert_eq!(cache.purge_containing(Coord::new(5, 5)), 1);
        assert!(!cache.covers(&a));
        assert!(cache.covers(&b));
    }

    #[test]
    fn persistence_roundtrips_and_checks_digest() {
        let oracle = oracle();
        let unique = std::process::id();
        let path = std::env::temp_dir().join(format!("deepfield-cache-{unique}.bin"));

        let mut cache = ExploredChunkCache::new(64, 16, 256, 7);
        let footprint = Footprint::new(Coord::new(-16, -16), 16);
        cache.store(derive_chunk(&oracle, footprint));
        cache.save(&path).expect("save");

        let mut restored = ExploredChunkCache::new(64, 16, 256, 7);
        assert_eq!(restored.load(&path).expect("load"), 1);
        assert!(restored.covers(&footprint));

        let mut wrong_constants = ExploredChunkCache::new(64, 16, 256, 8);
        assert_eq!(wrong_constants.load(&path).expect("load"), 0);
        assert!(wrong_constants.is_empty());

        let _ = fs::remove_file(&path);
    }
}
