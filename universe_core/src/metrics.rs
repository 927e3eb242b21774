use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-wide counters. Shared across the worker pool and the engine
/// owner, hence atomics; readers take a [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub coordinates_derived: AtomicU64,
    pub tiles_mined: AtomicU64,
    pub tiles_served_from_cache: AtomicU64,
    pub tiles_retried: AtomicU64,
    pub tiles_failed: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub stale_snapshots: AtomicU64,
    pub resyncs: AtomicU64,
    pub formula_mismatches: AtomicU64,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct MetricsSnapshot {
    pub coordinates_derived: u64,
    pub tiles_mined: u64,
    pub tiles_served_from_cache: u64,
    pub tiles_retried: u64,
    pub tiles_failed: u64,
    pub events_applied: u64,
    pub events_deduplicated: u64,
    pub stale_snapshots: u64,
    pub resyncs: u64,
    pub formula_mismatches: u64,
}

impl EngineMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            coordinates_derived: self.coordinates_derived.load(Ordering::Relaxed),
            tiles_mined: self.tiles_mined.load(Ordering::Relaxed),
            tiles_served_from_cache: self.tiles_served_from_cache.load(Ordering::Relaxed),
            tiles_retried: self.tiles_retried.load(Ordering::Relaxed),
            tiles_failed: self.tiles_failed.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            stale_snapshots: self.stale_snapshots.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            formula_mismatches: self.formula_mismatches.load(Ordering::Relaxed),
        }
    }
}
