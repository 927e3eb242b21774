//! Client-side engine for a ledger-governed procedural universe.
//!
//! The ledger stores only owned entities and event logs; everything else
//! is re-derived on demand from a one-way hash construction both sides
//! agree on. This crate keeps a locally readable view of that universe:
//! deterministic regeneration of arbitrary regions in parallel, plus a
//! replicated mirror of mutable entity state under eventual consistency.

pub mod cache;
pub mod chunks;
pub mod config;
pub mod constants;
pub mod engine;
pub mod entity;
pub mod hashing;
pub mod metrics;
pub mod miner;
pub mod oracle;
pub mod overlay;
pub mod projector;
pub mod reconcile;
mod scalar;
pub mod store;

pub use cache::{CacheError, ExploredChunkCache};
pub use chunks::{Chunk, Footprint};
pub use config::EngineConfig;
pub use constants::{ConstantsError, FormulaConstants, TierStats, BUILTIN_CONSTANTS};
pub use engine::{EngineError, SubmitError, UniverseEngine};
pub use entity::{
    BodyLocation, BodyStats, BonusFlags, Coord, DiscoveredBody, EntityClass, ProjectedResources,
    RarityTier, SpaceZone, StaticAttributes, VoyageStatics,
};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use miner::{CancelToken, ExploreHandle, ExploreUpdate, MinerPool};
pub use oracle::{CoordinateDerivation, NoiseChannel, Oracle};
pub use overlay::{
    ActionHandle, ActionKind, ActionLifecycle, ActionOverlay, ActionStatus, PendingAction,
    RetireOutcome, SpeculativeEffect,
};
pub use projector::project;
pub use reconcile::{
    ApplyCtx, EventSource, ReconcileError, ReconciliationLoop, SourceError, SyncState,
};
pub use scalar::{scalar_from_f32, scalar_from_u32, scalar_one, scalar_zero, Scalar};
pub use store::{
    DiscoveryOutcome, EntityRecord, EntityView, SnapshotApplied, StoreNotice, WorldStateStore,
};

/// Install a `tracing` fmt subscriber honoring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
