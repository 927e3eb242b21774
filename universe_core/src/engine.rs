//! The explicitly constructed engine context: owns the world-state store,
//! overlay, cache, worker pool and reconciliation loop, with explicit
//! `init`/`shutdown` lifecycle.
//!
//! Single-writer discipline: every mutation of store and overlay happens
//! through `&mut self` methods here; readers get copied-out views and
//! channel subscriptions.

use std::fs;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{error, info, warn};

use ledger_proto::{decode_checkpoint, digest_of, encode_checkpoint, Address, Checkpoint, EntityId};

use crate::cache::{CacheError, ExploredChunkCache};
use crate::chunks::Footprint;
use crate::config::EngineConfig;
use crate::constants::FormulaConstants;
use crate::entity::{Coord, EntityClass, RarityTier};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::miner::{ExploreHandle, MinerPool};
use crate::oracle::Oracle;
use crate::overlay::{ActionHandle, ActionKind, ActionOverlay};
use crate::reconcile::{
    ApplyCtx, EventSource, ReconcileError, ReconciliationLoop, SourceError, SyncState,
};
use crate::store::{DiscoveryOutcome, EntityView, StoreNotice, WorldStateStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint codec: {0}")]
    Codec(#[from] bincode::Error),
}

/// Why a submission was refused locally, before it ever reached the
/// ledger.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("entity {0} is not a body")]
    NotABody(EntityId),
}

/// The client engine. Construct with [`UniverseEngine::new`], then call
/// [`init`](UniverseEngine::init) before use and
/// [`shutdown`](UniverseEngine::shutdown) when done.
pub struct UniverseEngine {
    config: EngineConfig,
    constants: Arc<FormulaConstants>,
    store: WorldStateStore,
    overlay: ActionOverlay,
    cache: Arc<Mutex<ExploredChunkCache>>,
    pool: MinerPool,
    recon: ReconciliationLoop,
    source: Box<dyn EventSource>,
    metrics: Arc<EngineMetrics>,
    player: Address,
    bootstrap_owned: Vec<EntityId>,
}

impl UniverseEngine {
    pub fn new(
        config: EngineConfig,
        constants: FormulaConstants,
        source: Box<dyn EventSource>,
        player: Address,
    ) -> Self {
        let constants = Arc::new(constants);
        let constants_digest = digest_of(constants.as_ref());
        let oracle = Arc::new(Oracle::new(Arc::clone(&constants)));
        let cache = Arc::new(Mutex::new(ExploredChunkCache::new(
            config.cache_capacity_chunks,
            config.tile_side,
            config.max_chunk_side,
            constants_digest,
        )));
        let metrics = Arc::new(EngineMetrics::default());
        let pool = MinerPool::start(
            config.worker_count,
            config.tile_side,
            oracle,
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );
        let overlay = ActionOverlay::new(config.action_timeout_secs, config.parked_retention_secs());
        let recon = ReconciliationLoop::new(
            config.reorder_window,
            config.catch_up_batch,
            Checkpoint::GENESIS,
        );
        Self {
            config,
            constants,
            store: WorldStateStore::new(),
            overlay,
            cache,
            pool,
            recon,
            source,
            metrics,
            player,
            bootstrap_owned: Vec::new(),
        }
    }

    /// Restore persisted state, seed ownership, and catch up to the
    /// ledger head.
    pub fn init(&mut self) -> Result<(), EngineError> {
        fs::create_dir_all(&self.config.data_dir)?;

        let loaded = self
            .cache
            .lock()
            .expect("chunk cache mutex poisoned")
            .load(&self.config.cache_path())?;

        let checkpoint = self.load_checkpoint()?;
        self.recon = ReconciliationLoop::new(
            self.config.reorder_window,
            self.config.catch_up_batch,
            checkpoint,
        );

        self.bootstrap_owned = self.source.owned_entities(self.player)?;
        info!(
            target: "deepfield::engine",
            chunks = loaded,
            owned = self.bootstrap_owned.len(),
            checkpoint = %checkpoint,
            "engine initialized"
        );

        let mut ctx = ApplyCtx {
            store: &mut self.store,
            overlay: &mut self.overlay,
            cache: self.cache.as_ref(),
            constants: self.constants.as_ref(),
            metrics: self.metrics.as_ref(),
        };
        self.recon.catch_up(self.source.as_mut(), &mut ctx)?;
        self.save_checkpoint()?;
        Ok(())
    }

    /// Stop the worker pool and persist the cache and checkpoint.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.pool.shutdown();
        self.cache
            .lock()
            .expect("chunk cache mutex poisoned")
            .save(&self.config.cache_path())?;
        self.save_checkpoint()?;
        info!(target: "deepfield::engine", "engine shut down");
        Ok(())
    }

    /// Advance the engine: merge fresh discoveries, expire action
    /// timeouts, and drain the live event stream.
    pub fn tick(&mut self, now: u64) {
        self.merge_discoveries();

        for (_, targets) in self.overlay.tick(now) {
            for entity in targets {
                self.store.notify(StoreNotice::OverlayChanged(entity));
            }
        }

        match self.recon.state() {
            SyncState::Disconnected => {
                // Reconnect by catching up from the persisted checkpoint.
                if let Err(err) = self.catch_up() {
                    warn!(target: "deepfield::engine", error = %err, "reconnect failed");
                }
            }
            SyncState::CatchingUp | SyncState::Live => self.pump_live(),
        }
    }

    fn catch_up(&mut self) -> Result<(), EngineError> {
        let mut ctx = ApplyCtx {
            store: &mut self.store,
            overlay: &mut self.overlay,
            cache: self.cache.as_ref(),
            constants: self.constants.as_ref(),
            metrics: self.metrics.as_ref(),
        };
        self.recon.catch_up(self.source.as_mut(), &mut ctx)?;
        self.save_checkpoint()?;
        Ok(())
    }

    fn pump_live(&mut self) {
        let events = match self.source.poll_live() {
            Ok(events) => events,
            Err(err) => {
                warn!(target: "deepfield::engine", error = %err, "live poll failed");
                self.recon.mark_disconnected();
                return;
            }
        };
        if let Err(err) = self.recon.ingest_live(events, &self.metrics) {
            match err {
                ReconcileError::ReorderWindowExceeded { .. } => {
                    warn!(target: "deepfield::engine", error = %err, "resyncing");
                    let mut ctx = ApplyCtx {
                        store: &mut self.store,
                        overlay: &mut self.overlay,
                        cache: self.cache.as_ref(),
                        constants: self.constants.as_ref(),
                        metrics: self.metrics.as_ref(),
                    };
                    if let Err(err) = self.recon.resync(self.source.as_mut(), &mut ctx) {
                        warn!(target: "deepfield::engine", error = %err, "resync failed");
                        self.recon.mark_disconnected();
                    }
                }
                ReconcileError::Source(_) => self.recon.mark_disconnected(),
            }
            return;
        }
        let mut ctx = ApplyCtx {
            store: &mut self.store,
            overlay: &mut self.overlay,
            cache: self.cache.as_ref(),
            constants: self.constants.as_ref(),
            metrics: self.metrics.as_ref(),
        };
        let applied = self.recon.flush(&mut ctx);
        if !applied.is_empty() {
            if let Err(err) = self.save_checkpoint() {
                warn!(target: "deepfield::engine", error = %err, "checkpoint persist failed");
            }
        }
    }

    /// Pull derived bodies out of the pool and merge them into the store.
    fn merge_discoveries(&mut self) {
        for body in self.pool.drain_discoveries() {
            match self.store.insert_discovered(&body, &self.constants) {
                DiscoveryOutcome::Inserted => {
                    let id = body.location.id;
                    if let Some(snapshot) = self.recon.take_pending_snapshot(id) {
                        self.store.apply_snapshot(id, snapshot);
                    }
                    if let Some(asserted) = self.recon.pending_digest(id) {
                        let local = digest_of(&body.statics);
                        if local != asserted {
                            self.report_mismatch(body.location.coord);
                        }
                    }
                }
                DiscoveryOutcome::AlreadyKnown => {}
                DiscoveryOutcome::Mismatch { existing } => {
                    error!(
                        target: "deepfield::engine",
                        coord = %body.location.coord,
                        derived = %body.location.id,
                        existing = %existing,
                        "derived entity id disagrees with tracked entity"
                    );
                    self.report_mismatch(body.location.coord);
                }
            }
        }
    }

    fn report_mismatch(&mut self, coord: Coord) {
        EngineMetrics::bump(&self.metrics.formula_mismatches);
        self.cache
            .lock()
            .expect("chunk cache mutex poisoned")
            .purge_containing(coord);
    }

    /// Submit a user action. The speculative effect is visible on the
    /// next read; lifecycle notifications arrive on the returned handle.
    pub fn submit_action(&mut self, kind: ActionKind, now: u64) -> Result<ActionHandle, SubmitError> {
        for target in kind.targets() {
            match self.store.record(target) {
                None => return Err(SubmitError::UnknownEntity(target)),
                Some(record) => {
                    if record.class.as_body().is_none() {
                        return Err(SubmitError::NotABody(target));
                    }
                }
            }
        }
        let targets = kind.targets();
        let handle = self.overlay.submit(kind, now);
        for entity in targets {
            self.store.notify(StoreNotice::OverlayChanged(entity));
        }
        Ok(handle)
    }

    /// Current merged view of one entity: snapshot, lazy projection, and
    /// speculative overlay, as of `now`.
    pub fn query_entity(&self, id: EntityId, now: u64) -> Option<EntityView> {
        self.store
            .materialize(id, now, &self.overlay, &self.constants)
    }

    pub fn query_at(&self, coord: Coord, now: u64) -> Option<EntityView> {
        self.store
            .id_at(coord)
            .and_then(|id| self.query_entity(id, now))
    }

    /// Start exploring a region. Returns a cancellable stream handle.
    pub fn explore_region(&mut self, footprint: Footprint, rarity_floor: RarityTier) -> ExploreHandle {
        self.pool.explore(footprint, rarity_floor)
    }

    /// Move the mining focal point (usually the viewport center).
    pub fn set_focus(&self, focus: Coord) {
        self.pool.set_focus(focus);
    }

    /// Update the visible viewport; chunks overlapping it are exempt from
    /// cache eviction.
    pub fn set_viewport(&self, viewport: Footprint) {
        self.cache
            .lock()
            .expect("chunk cache mutex poisoned")
            .set_viewport(viewport);
    }

    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<StoreNotice> {
        self.store.subscribe()
    }

    pub fn sync_state(&self) -> SyncState {
        self.recon.state()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.recon.checkpoint()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn entities_owned_by(&self, owner: Address) -> Vec<EntityId> {
        self.store.entities_owned_by(owner)
    }

    /// Entities the ledger reported as owned at bootstrap.
    pub fn owned_bootstrap(&self) -> &[EntityId] {
        &self.bootstrap_owned
    }

    fn load_checkpoint(&self) -> Result<Checkpoint, EngineError> {
        let path = self.config.checkpoint_path();
        if !path.exists() {
            return Ok(Checkpoint::GENESIS);
        }
        let raw = fs::read(&path)?;
        Ok(decode_checkpoint(&raw)?)
    }

    fn save_checkpoint(&self) -> Result<(), EngineError> {
        let encoded = encode_checkpoint(&self.recon.checkpoint())?;
        fs::write(self.config.checkpoint_path(), encoded)?;
        Ok(())
    }
}

impl UniverseEngine {
    /// Convenience for tests and embedders that only need a read of the
    /// store size.
    pub fn known_entities(&self) -> usize {
        self.store.len()
    }

    /// The entity class tracked for `id`, if known.
    pub fn entity_class(&self, id: EntityId) -> Option<EntityClass> {
        self.store.record(id).map(|record| record.class)
    }
}
