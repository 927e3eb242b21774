//! Consumes the ordered ledger event stream and applies confirmed diffs
//! to the world-state store, retiring matching overlay entries.
//!
//! Per-connection state machine: `Disconnected -> CatchingUp -> Live`.
//! Application is idempotent on `(block_height, log_index)`; live events
//! buffer-and-sort inside a bounded reordering window, and an event
//! arriving from before the window forces a resync from the last safe
//! checkpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use ledger_proto::{
    digest_of, Address, Checkpoint, DynamicState, EntityId, EventKey, EventKind, LedgerEvent,
};

use crate::cache::ExploredChunkCache;
use crate::constants::FormulaConstants;
use crate::entity::{EntityClass, VoyageStatics};
use crate::metrics::EngineMetrics;
use crate::overlay::ActionOverlay;
use crate::scalar::Scalar;
use crate::store::{SnapshotApplied, WorldStateStore};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("ledger source unavailable: {0}")]
    Unavailable(String),
    #[error("ledger source request failed: {0}")]
    Request(String),
}

/// Read-only window onto the ledger, provided by the transport
/// collaborator.
pub trait EventSource: Send {
    /// Current head position of the ledger.
    fn head(&mut self) -> Result<EventKey, SourceError>;

    /// Confirmed events strictly after `checkpoint`, in ledger order, at
    /// most `limit` of them.
    fn fetch_after(
        &mut self,
        checkpoint: Checkpoint,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, SourceError>;

    /// Events observed since the last poll. Delivery may be reordered or
    /// duplicated; the reconciliation loop sorts that out.
    fn poll_live(&mut self) -> Result<Vec<LedgerEvent>, SourceError>;

    /// Bulk ownership query used to seed catch-up.
    fn owned_entities(&mut self, owner: Address) -> Result<Vec<EntityId>, SourceError>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncState {
    Disconnected,
    CatchingUp,
    Live,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Disconnected => "disconnected",
            SyncState::CatchingUp => "catching up",
            SyncState::Live => "live",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("event {key} arrived outside the reorder window (checkpoint {checkpoint})")]
    ReorderWindowExceeded { key: EventKey, checkpoint: Checkpoint },
}

/// Everything event application may touch. The engine owns all of it;
/// application itself is synchronous and fast.
pub struct ApplyCtx<'a> {
    pub store: &'a mut WorldStateStore,
    pub overlay: &'a mut ActionOverlay,
    pub cache: &'a Mutex<ExploredChunkCache>,
    pub constants: &'a FormulaConstants,
    pub metrics: &'a EngineMetrics,
}

pub struct ReconciliationLoop {
    state: SyncState,
    checkpoint: Checkpoint,
    buffer: BTreeMap<EventKey, LedgerEvent>,
    applied_recent: BTreeSet<EventKey>,
    /// Confirmed dynamic state for entities the store has not discovered
    /// yet; applied when chunk generation surfaces them.
    pending_snapshots: HashMap<EntityId, DynamicState>,
    /// Statics digests from mint events for entities not yet derived.
    pending_digests: HashMap<EntityId, u64>,
    window: usize,
    catch_up_batch: usize,
}

impl ReconciliationLoop {
    pub fn new(window: usize, catch_up_batch: usize, checkpoint: Checkpoint) -> Self {
        Self {
            state: SyncState::Disconnected,
            checkpoint,
            buffer: BTreeMap::new(),
            applied_recent: BTreeSet::new(),
            pending_snapshots: HashMap::new(),
            pending_digests: HashMap::new(),
            window: window.max(1),
            catch_up_batch: catch_up_batch.max(1),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Note a transport failure. Buffered events are dropped (the next
    /// catch-up refetches them); pending actions stay `Submitted`.
    pub fn mark_disconnected(&mut self) {
        if self.state != SyncState::Disconnected {
            warn!(target: "deepfield::reconcile", "ledger connection lost");
        }
        self.state = SyncState::Disconnected;
        self.buffer.clear();
    }

    /// Bulk-fetch history from the checkpoint to the head, applying in
    /// strict ledger order, then go live.
    pub fn catch_up(
        &mut self,
        source: &mut dyn EventSource,
        ctx: &mut ApplyCtx<'_>,
    ) -> Result<usize, ReconcileError> {
        self.state = SyncState::CatchingUp;
        let mut applied = 0usize;
        loop {
            let batch = source.fetch_after(self.checkpoint, self.catch_up_batch)?;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                if self.checkpoint.covers(event.key) {
                    EngineMetrics::bump(&ctx.metrics.events_deduplicated);
                    continue;
                }
                self.apply_now(event, ctx);
                applied += 1;
            }
        }
        let head = source.head()?;
        self.state = SyncState::Live;
        info!(
            target: "deepfield::reconcile",
            applied,
            checkpoint = %self.checkpoint,
            head = %head,
            "caught up, going live"
        );
        Ok(applied)
    }

    /// Accept live events into the reorder buffer.
    ///
    /// Redelivery of an already-applied event is a no-op. An event keyed
    /// before the checkpoint that was *not* seen recently indicates the
    /// reorder window was exceeded; the caller must resync rather than
    /// risk applying stale over fresh.
    pub fn ingest_live(&mut self, events: Vec<LedgerEvent>, metrics: &EngineMetrics) -> Result<(), ReconcileError> {
        for event in events {
            if self.checkpoint.covers(event.key) {
                if self.applied_recent.contains(&event.key) {
                    EngineMetrics::bump(&metrics.events_deduplicated);
                    continue;
                }
                return Err(ReconcileError::ReorderWindowExceeded {
                    key: event.key,
                    checkpoint: self.checkpoint,
                });
            }
            if self.buffer.insert(event.key, event).is_some() {
                EngineMetrics::bump(&metrics.events_deduplicated);
            }
        }
        Ok(())
    }

    /// Apply everything buffered, in key order. Returns the applied keys.
    pub fn flush(&mut self, ctx: &mut ApplyCtx<'_>) -> Vec<EventKey> {
        let mut applied = Vec::with_capacity(self.buffer.len());
        while let Some((key, event)) = self.buffer.pop_first() {
            self.apply_now(event, ctx);
            applied.push(key);
        }
        applied
    }

    /// Drop buffered state and rebuild from the last safe checkpoint.
    pub fn resync(
        &mut self,
        source: &mut dyn EventSource,
        ctx: &mut ApplyCtx<'_>,
    ) -> Result<usize, ReconcileError> {
        EngineMetrics::bump(&ctx.metrics.resyncs);
        warn!(
            target: "deepfield::reconcile",
            checkpoint = %self.checkpoint,
            "forcing resync"
        );
        self.buffer.clear();
        self.catch_up(source, ctx)
    }

    /// Confirmed dynamic state waiting for `id` to be discovered locally.
    pub fn take_pending_snapshot(&mut self, id: EntityId) -> Option<DynamicState> {
        self.pending_snapshots.remove(&id)
    }

    /// Statics digest the ledger asserted for `id`, if any.
    pub fn pending_digest(&self, id: EntityId) -> Option<u64> {
        self.pending_digests.get(&id).copied()
    }

    fn apply_now(&mut self, event: LedgerEvent, ctx: &mut ApplyCtx<'_>) {
        let key = event.key;
        self.apply_event(event, ctx);
        self.checkpoint.advance(key);
        self.applied_recent.insert(key);
        while self.applied_recent.len() > self.window {
            self.applied_recent.pop_first();
        }
        EngineMetrics::bump(&ctx.metrics.events_applied);
    }

    /// Check a ledger-asserted statics digest against the local
    /// derivation. A mismatch is a correctness bug (client/ledger drift):
    /// it purges the containing cached chunks so the region re-derives,
    /// and it is always logged and counted.
    fn verify_statics_digest(&mut self, id: EntityId, asserted: u64, ctx: &mut ApplyCtx<'_>) {
        let Some(record) = ctx.store.record(id) else {
            self.pending_digests.insert(id, asserted);
            return;
        };
        let EntityClass::Body(statics) = &record.class else {
            return;
        };
        let local = digest_of(statics);
        if local != asserted {
            let coord = statics.coord;
            EngineMetrics::bump(&ctx.metrics.formula_mismatches);
            error!(
                target: "deepfield::reconcile",
                entity = %id,
                coord = %coord,
                local,
                asserted,
                "statics digest mismatch: local derivation disagrees with ledger"
            );
            let purged = ctx
                .cache
                .lock()
                .expect("chunk cache mutex poisoned")
                .purge_containing(coord);
            debug!(target: "deepfield::reconcile", purged, "cached chunks purged after mismatch");
        }
    }

    fn apply_event(&mut self, event: LedgerEvent, ctx: &mut ApplyCtx<'_>) {
        let entity_id = event.entity_id;
        match event.kind {
            EventKind::EntityMinted { statics_digest, .. } => {
                self.verify_statics_digest(entity_id, statics_digest, ctx);
            }
            EventKind::SnapshotUpdated {
                dynamic,
                statics_digest,
            } => {
                if let Some(asserted) = statics_digest {
                    self.verify_statics_digest(entity_id, asserted, ctx);
                }
                match ctx.store.apply_snapshot(entity_id, dynamic) {
                    SnapshotApplied::Applied => {}
                    SnapshotApplied::Stale => {
                        EngineMetrics::bump(&ctx.metrics.stale_snapshots);
                    }
                    SnapshotApplied::UnknownEntity => {
                        // Keep the freshest confirmed state until the
                        // containing chunk is generated.
                        let slot = self.pending_snapshots.entry(entity_id).or_default();
                        if dynamic.updated_at >= slot.updated_at {
                            *slot = dynamic;
                        }
                    }
                }
            }
            EventKind::OwnerChanged { owner, timestamp } => {
                if ctx
                    .store
                    .set_owner(entity_id, owner, timestamp, ctx.constants)
                    == SnapshotApplied::Stale
                {
                    EngineMetrics::bump(&ctx.metrics.stale_snapshots);
                }
            }
            EventKind::VoyageQueued { voyage } => {
                let statics = VoyageStatics {
                    player: voyage.player,
                    from: voyage.from,
                    to: voyage.to,
                    energy: Scalar::from_raw(voyage.energy),
                    silver: Scalar::from_raw(voyage.silver),
                    departure_time: voyage.departure_time,
                    arrival_time: voyage.arrival_time,
                };
                let snapshot = DynamicState {
                    owner: voyage.player,
                    energy: voyage.energy,
                    silver: voyage.silver,
                    locked_until: 0,
                    updated_at: voyage.departure_time,
                };
                ctx.store
                    .insert_confirmed(voyage.voyage_id, EntityClass::Voyage(statics), snapshot);
            }
            EventKind::VoyageArrived {
                voyage_id,
                energy_delivered,
                silver_delivered,
                timestamp,
            } => {
                if ctx.store.settle_voyage(
                    voyage_id,
                    entity_id,
                    Scalar::from_raw(energy_delivered),
                    Scalar::from_raw(silver_delivered),
                    timestamp,
                    ctx.constants,
                ) == SnapshotApplied::Stale
                {
                    EngineMetrics::bump(&ctx.metrics.stale_snapshots);
                }
            }
            EventKind::ActionConfirmed { action } => {
                let touched = ctx.overlay.touched_by(action);
                ctx.overlay.on_confirmed(action);
                for entity in touched {
                    ctx.store.notify(crate::store::StoreNotice::OverlayChanged(entity));
                }
            }
            EventKind::ActionFailed { action, ref reason } => {
                let touched = ctx.overlay.touched_by(action);
                ctx.overlay.on_failed(action, reason);
                for entity in touched {
                    ctx.store.notify(crate::store::StoreNotice::OverlayChanged(entity));
                }
            }
        }
    }
}
