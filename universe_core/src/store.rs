use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use ledger_proto::{Address, DynamicState, EntityId};

use crate::constants::FormulaConstants;
use crate::entity::{Coord, DiscoveredBody, EntityClass, ProjectedResources};
use crate::overlay::{ActionOverlay, PendingAction};
use crate::projector::project;
use crate::scalar::Scalar;

/// Change notifications broadcast to readers (UI, renderer).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreNotice {
    /// A new entity entered the store, procedurally or by mint.
    Discovered(EntityId),
    /// The authoritative snapshot of an entity changed.
    Updated(EntityId),
    /// The speculative overlay over an entity changed.
    OverlayChanged(EntityId),
}

/// One entity as tracked locally: immutable class payload plus the last
/// confirmed snapshot.
#[derive(Clone, PartialEq, Debug)]
pub struct EntityRecord {
    pub class: EntityClass,
    pub snapshot: DynamicState,
    /// Whether a confirmed ledger event has ever touched this entity.
    pub confirmed: bool,
    pub discoverer: Option<Address>,
}

/// Copied-out read model of one entity at a point in time. Readers never
/// hold references into the store.
#[derive(Clone, PartialEq, Debug)]
pub struct EntityView {
    pub id: EntityId,
    pub class: EntityClass,
    pub snapshot: DynamicState,
    /// Authoritative lazy projection at `as_of`.
    pub projected: ProjectedResources,
    /// Projection with stacked speculative overlay effects applied.
    pub speculative: ProjectedResources,
    pub pending: Vec<PendingAction>,
    pub pending_owner: Option<Address>,
    pub voyage_progress: Option<Scalar>,
    pub as_of: u64,
}

/// Result of applying a confirmed snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotApplied {
    Applied,
    /// Older than what the store already holds; ignored.
    Stale,
    UnknownEntity,
}

/// Result of inserting a procedurally discovered body.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiscoveryOutcome {
    Inserted,
    AlreadyKnown,
    /// Another entity id occupies this coordinate: the local derivation
    /// and the ledger disagree.
    Mismatch { existing: EntityId },
}

/// Authoritative-plus-optimistic map of all known entities.
///
/// Single-writer: only the engine mutates the store. Reads are copied-out
/// `EntityView`s, so no reader ever observes a half-applied event.
pub struct WorldStateStore {
    entities: HashMap<EntityId, EntityRecord>,
    by_coord: HashMap<Coord, EntityId>,
    subscribers: Vec<Sender<StoreNotice>>,
}

impl WorldStateStore {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            by_coord: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn record(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    pub fn id_at(&self, coord: Coord) -> Option<EntityId> {
        self.by_coord.get(&coord).copied()
    }

    pub fn entities_owned_by(&self, owner: Address) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, record)| record.snapshot.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Subscribe to change notifications. Dropped receivers are pruned on
    /// the next broadcast.
    pub fn subscribe(&mut self) -> Receiver<StoreNotice> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub fn notify(&mut self, notice: StoreNotice) {
        self.subscribers.retain(|sender| sender.send(notice).is_ok());
    }

    /// Insert a body surfaced by chunk generation. The snapshot starts at
    /// genesis values; a confirmed event may already have created the
    /// entity, in which case the derivation only corroborates it.
    pub fn insert_discovered(
        &mut self,
        body: &DiscoveredBody,
        constants: &FormulaConstants,
    ) -> DiscoveryOutcome {
        let id = body.location.id;
        if let Some(existing) = self.by_coord.get(&body.location.coord) {
            if *existing != id {
                return DiscoveryOutcome::Mismatch { existing: *existing };
            }
            return DiscoveryOutcome::AlreadyKnown;
        }
        if self.entities.contains_key(&id) {
            self.by_coord.insert(body.location.coord, id);
            return DiscoveryOutcome::AlreadyKnown;
        }
        let record = EntityRecord {
            class: EntityClass::Body(body.statics),
            snapshot: body.statics.genesis_dynamic(constants),
            confirmed: false,
            discoverer: None,
        };
        self.entities.insert(id, record);
        self.by_coord.insert(body.location.coord, id);
        self.notify(StoreNotice::Discovered(id));
        DiscoveryOutcome::Inserted
    }

    /// Insert an entity created explicitly by a confirmed ledger event.
    pub fn insert_confirmed(&mut self, id: EntityId, class: EntityClass, snapshot: DynamicState) {
        if let EntityClass::Body(statics) = &class {
            self.by_coord.insert(statics.coord, id);
        }
        let previously_known = self
            .entities
            .insert(
                id,
                EntityRecord {
                    class,
                    snapshot,
                    confirmed: true,
                    discoverer: None,
                },
            )
            .is_some();
        if previously_known {
            self.notify(StoreNotice::Updated(id));
        } else {
            self.notify(StoreNotice::Discovered(id));
        }
    }

    /// Replace an entity's snapshot with a newer confirmed one. Snapshots
    /// only move forward; an older timestamp is rejected as stale.
    pub fn apply_snapshot(&mut self, id: EntityId, dynamic: DynamicState) -> SnapshotApplied {
        let Some(record) = self.entities.get_mut(&id) else {
            return SnapshotApplied::UnknownEntity;
        };
        if dynamic.updated_at < record.snapshot.updated_at {
            warn!(
                target: "deepfield::store",
                entity = %id,
                have = record.snapshot.updated_at,
                got = dynamic.updated_at,
                "ignoring stale snapshot"
            );
            return SnapshotApplied::Stale;
        }
        record.snapshot = dynamic;
        record.confirmed = true;
        self.notify(StoreNotice::Updated(id));
        SnapshotApplied::Applied
    }

    /// Apply an ownership change at `timestamp`. Resources are
    /// materialized at the transition so the growth discontinuity (owned
    /// bodies grow, unowned do not) lands exactly at the confirmed time.
    pub fn set_owner(
        &mut self,
        id: EntityId,
        owner: Address,
        timestamp: u64,
        constants: &FormulaConstants,
    ) -> SnapshotApplied {
        let Some(record) = self.entities.get_mut(&id) else {
            return SnapshotApplied::UnknownEntity;
        };
        if timestamp < record.snapshot.updated_at {
            return SnapshotApplied::Stale;
        }
        if let EntityClass::Body(statics) = &record.class {
            let projected = project(statics, &record.snapshot, timestamp, constants);
            record.snapshot.energy = projected.energy.raw();
            record.snapshot.silver = projected.silver.raw();
        }
        record.snapshot.owner = owner;
        record.snapshot.updated_at = timestamp;
        record.confirmed = true;
        self.notify(StoreNotice::Updated(id));
        SnapshotApplied::Applied
    }

    /// Settle an arrived voyage onto its target body and drop the voyage
    /// entity. Delivered resources may push the target past its cap; the
    /// projector only ever grows it back down toward the cap from there.
    pub fn settle_voyage(
        &mut self,
        voyage_id: EntityId,
        target: EntityId,
        energy_delivered: Scalar,
        silver_delivered: Scalar,
        timestamp: u64,
        constants: &FormulaConstants,
    ) -> SnapshotApplied {
        let applied = {
            let Some(record) = self.entities.get_mut(&target) else {
                return SnapshotApplied::UnknownEntity;
            };
            if timestamp < record.snapshot.updated_at {
                SnapshotApplied::Stale
            } else {
                if let EntityClass::Body(statics) = &record.class {
                    let projected = project(statics, &record.snapshot, timestamp, constants);
                    record.snapshot.energy = (projected.energy + energy_delivered).raw();
                    record.snapshot.silver = (projected.silver + silver_delivered).raw();
                } else {
                    record.snapshot.energy += energy_delivered.raw();
                    record.snapshot.silver += silver_delivered.raw();
                }
                record.snapshot.updated_at = timestamp;
                record.confirmed = true;
                SnapshotApplied::Applied
            }
        };
        if applied == SnapshotApplied::Applied {
            self.entities.remove(&voyage_id);
            self.notify(StoreNotice::Updated(target));
        }
        applied
    }

    /// Forget an entity entirely. Used when its derivation proved wrong.
    pub fn purge(&mut self, id: EntityId) {
        if let Some(record) = self.entities.remove(&id) {
            if let EntityClass::Body(statics) = record.class {
                self.by_coord.remove(&statics.coord);
            }
            debug!(target: "deepfield::store", entity = %id, "purged entity");
        }
    }

    /// Copied-out view of one entity: confirmed snapshot, lazy projection
    /// as of `now`, and the speculative overlay stacked on top, in that
    /// override order.
    pub fn materialize(
        &self,
        id: EntityId,
        now: u64,
        overlay: &ActionOverlay,
        constants: &FormulaConstants,
    ) -> Option<EntityView> {
        let record = self.entities.get(&id)?;
        let effect = overlay.speculative_effect_on(id);
        let pending = overlay.pending_for(id);

        let (projected, voyage_progress) = match &record.class {
            EntityClass::Body(statics) => {
                (project(statics, &record.snapshot, now, constants), None)
            }
            EntityClass::Voyage(voyage) => (
                ProjectedResources {
                    energy: voyage.energy,
                    silver: voyage.silver,
                    lockup_remaining: 0,
                },
                Some(voyage.progress(now)),
            ),
        };

        let speculative = ProjectedResources {
            energy: (projected.energy + effect.energy_delta).max(Scalar::zero()),
            silver: (projected.silver + effect.silver_delta).max(Scalar::zero()),
            lockup_remaining: if effect.pending_lockup {
                projected.lockup_remaining.max(constants.lockup_duration_secs)
            } else {
                projected.lockup_remaining
            },
        };

        Some(EntityView {
            id,
            class: record.class,
            snapshot: record.snapshot,
            projected,
            speculative,
            pending,
            pending_owner: effect.pending_owner,
            voyage_progress,
            as_of: now,
        })
    }
}

impl Default for WorldStateStore {
    fn default() -> Self {
        Self::new()
    }
}
