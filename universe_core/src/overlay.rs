use std::collections::HashMap;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info};

use ledger_proto::{ActionId, Address, EntityId};

use crate::scalar::Scalar;

/// What a submitted action intends to do to the universe.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ActionKind {
    /// Launch a transfer of energy (and optionally silver) between bodies.
    Move {
        from: EntityId,
        to: EntityId,
        energy: Scalar,
        silver: Scalar,
    },
    /// Spend silver upgrading a body along one branch.
    Upgrade {
        target: EntityId,
        branch: u8,
        silver_cost: Scalar,
    },
    /// Hand ownership of a body to another player.
    Transfer {
        target: EntityId,
        recipient: Address,
    },
    /// Prospect a body for an artifact; locks the body on confirmation.
    Prospect { target: EntityId },
}

impl ActionKind {
    pub fn targets(&self) -> Vec<EntityId> {
        match self {
            ActionKind::Move { from, to, .. } => vec![*from, *to],
            ActionKind::Upgrade { target, .. }
            | ActionKind::Transfer { target, .. }
            | ActionKind::Prospect { target } => vec![*target],
        }
    }

    /// Display-only deltas this action applies to each touched entity
    /// while unconfirmed.
    pub fn speculative_effects(&self) -> Vec<(EntityId, SpeculativeEffect)> {
        match self {
            ActionKind::Move {
                from,
                to,
                energy,
                silver,
            } => vec![
                (
                    *from,
                    SpeculativeEffect {
                        energy_delta: -*energy,
                        silver_delta: -*silver,
                        ..SpeculativeEffect::default()
                    },
                ),
                (
                    *to,
                    SpeculativeEffect {
                        inbound_voyages: 1,
                        ..SpeculativeEffect::default()
                    },
                ),
            ],
            ActionKind::Upgrade {
                target,
                silver_cost,
                ..
            } => vec![(
                *target,
                SpeculativeEffect {
                    silver_delta: -*silver_cost,
                    ..SpeculativeEffect::default()
                },
            )],
            ActionKind::Transfer { target, recipient } => vec![(
                *target,
                SpeculativeEffect {
                    pending_owner: Some(*recipient),
                    ..SpeculativeEffect::default()
                },
            )],
            ActionKind::Prospect { target } => vec![(
                *target,
                SpeculativeEffect {
                    pending_lockup: true,
                    ..SpeculativeEffect::default()
                },
            )],
        }
    }
}

/// Speculative delta on one entity. Effects from several pending actions
/// stack additively; retiring one leaves the rest in place.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SpeculativeEffect {
    pub energy_delta: Scalar,
    pub silver_delta: Scalar,
    pub inbound_voyages: u32,
    pub pending_owner: Option<Address>,
    pub pending_lockup: bool,
}

impl SpeculativeEffect {
    fn stack(&mut self, other: &SpeculativeEffect) {
        self.energy_delta += other.energy_delta;
        self.silver_delta += other.silver_delta;
        self.inbound_voyages += other.inbound_voyages;
        // Later pending owners shadow earlier ones in the stacked view.
        if other.pending_owner.is_some() {
            self.pending_owner = other.pending_owner;
        }
        self.pending_lockup |= other.pending_lockup;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActionStatus {
    Submitted,
    Confirmed,
    Failed,
    TimedOut,
}

/// Lifecycle notifications delivered on an action's handle.
///
/// `Confirmed` and `Failed` are terminal and arrive at most once per
/// action. `TimedOut` is provisional: the network may still confirm the
/// action later, in which case a terminal notification follows.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ActionLifecycle {
    Confirmed,
    Failed { reason: String },
    TimedOut,
}

/// A user-submitted action not yet settled by the ledger.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub submitted_at: u64,
    pub deadline: u64,
    pub status: ActionStatus,
}

/// Handle returned from submission. Lifecycle notifications arrive on
/// `events`; dropping the handle is safe and merely discards them.
pub struct ActionHandle {
    pub id: ActionId,
    pub events: Receiver<ActionLifecycle>,
}

/// How a retirement request resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RetireOutcome {
    /// Retired from the active overlay.
    Retired,
    /// Retired after its timeout had already been announced.
    RetiredLate,
    /// Not tracked (already retired, or never ours); a no-op.
    Unknown,
}

struct TrackedAction {
    action: PendingAction,
    notify: Sender<ActionLifecycle>,
}

struct ParkedAction {
    notify: Sender<ActionLifecycle>,
    expires_at: u64,
}

/// Tracks submitted-but-unconfirmed actions and their speculative effect
/// on entity views.
///
/// Single-writer: the engine owns the overlay and is the only mutator.
/// Timed-out actions are parked rather than forgotten so a late
/// confirmation still retires them exactly once.
pub struct ActionOverlay {
    next_id: u64,
    timeout_secs: u64,
    parked_retention_secs: u64,
    active: HashMap<ActionId, TrackedAction>,
    parked: HashMap<ActionId, ParkedAction>,
    submission_order: Vec<ActionId>,
}

impl ActionOverlay {
    pub fn new(timeout_secs: u64, parked_retention_secs: u64) -> Self {
        Self {
            next_id: 1,
            timeout_secs,
            parked_retention_secs,
            active: HashMap::new(),
            parked: HashMap::new(),
            submission_order: Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Record a new action and apply its speculative effect immediately.
    pub fn submit(&mut self, kind: ActionKind, now: u64) -> ActionHandle {
        let id = ActionId(self.next_id);
        self.next_id += 1;
        let (notify, events) = bounded(4);
        let action = PendingAction {
            id,
            kind,
            submitted_at: now,
            deadline: now + self.timeout_secs,
            status: ActionStatus::Submitted,
        };
        debug!(target: "deepfield::overlay", action = %id, "action submitted");
        self.active.insert(id, TrackedAction { action, notify });
        self.submission_order.push(id);
        ActionHandle { id, events }
    }

    /// Pending actions touching `entity`, in submission order.
    pub fn pending_for(&self, entity: EntityId) -> Vec<PendingAction> {
        self.submission_order
            .iter()
            .filter_map(|id| self.active.get(id))
            .filter(|tracked| tracked.action.kind.targets().contains(&entity))
            .map(|tracked| tracked.action.clone())
            .collect()
    }

    /// Stacked speculative effect of every active action touching
    /// `entity`.
    pub fn speculative_effect_on(&self, entity: EntityId) -> SpeculativeEffect {
        let mut combined = SpeculativeEffect::default();
        for id in &self.submission_order {
            let Some(tracked) = self.active.get(id) else {
                continue;
            };
            for (touched, effect) in tracked.action.kind.speculative_effects() {
                if touched == entity {
                    combined.stack(&effect);
                }
            }
        }
        combined
    }

    /// Entities whose speculative view would change if `action` retired.
    pub fn touched_by(&self, action: ActionId) -> Vec<EntityId> {
        self.active
            .get(&action)
            .map(|tracked| tracked.action.kind.targets())
            .unwrap_or_default()
    }

    /// A confirmation arrived from the ledger. Idempotent: retiring an
    /// unknown or already-retired action is a no-op.
    pub fn on_confirmed(&mut self, action: ActionId) -> RetireOutcome {
        if let Some(tracked) = self.active.remove(&action) {
            self.submission_order.retain(|id| *id != action);
            let _ = tracked.notify.send(ActionLifecycle::Confirmed);
            debug!(target: "deepfield::overlay", action = %action, "action confirmed");
            return RetireOutcome::Retired;
        }
        if let Some(parked) = self.parked.remove(&action) {
            let _ = parked.notify.send(ActionLifecycle::Confirmed);
            info!(
                target: "deepfield::overlay",
                action = %action,
                "late confirmation after timeout"
            );
            return RetireOutcome::RetiredLate;
        }
        RetireOutcome::Unknown
    }

    /// The ledger rejected the action. The speculative effect vanishes
    /// without any lasting change; the reason reaches the caller through
    /// the handle.
    pub fn on_failed(&mut self, action: ActionId, reason: &str) -> RetireOutcome {
        if let Some(tracked) = self.active.remove(&action) {
            self.submission_order.retain(|id| *id != action);
            let _ = tracked.notify.send(ActionLifecycle::Failed {
                reason: reason.to_string(),
            });
            info!(
                target: "deepfield::overlay",
                action = %action,
                reason,
                "action failed"
            );
            return RetireOutcome::Retired;
        }
        if let Some(parked) = self.parked.remove(&action) {
            let _ = parked.notify.send(ActionLifecycle::Failed {
                reason: reason.to_string(),
            });
            return RetireOutcome::RetiredLate;
        }
        RetireOutcome::Unknown
    }

    /// Advance timeouts. Actions past their deadline announce `TimedOut`
    /// and move to the parked ledger; parked entries past their retention
    /// are dropped for good. Returns each timed-out action with the
    /// entities its withdrawal touches.
    pub fn tick(&mut self, now: u64) -> Vec<(ActionId, Vec<EntityId>)> {
        let expired: Vec<ActionId> = self
            .active
            .iter()
            .filter(|(_, tracked)| now >= tracked.action.deadline)
            .map(|(id, _)| *id)
            .collect();

        let mut timed_out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(tracked) = self.active.remove(&id) {
                self.submission_order.retain(|other| *other != id);
                let targets = tracked.action.kind.targets();
                let _ = tracked.notify.send(ActionLifecycle::TimedOut);
                info!(target: "deepfield::overlay", action = %id, "action timed out");
                self.parked.insert(
                    id,
                    ParkedAction {
                        notify: tracked.notify,
                        expires_at: now + self.parked_retention_secs,
                    },
                );
                timed_out.push((id, targets));
            }
        }

        self.parked.retain(|_, parked| now < parked.expires_at);
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(tag: u8) -> EntityId {
        EntityId([tag; 32])
    }

    fn move_kind(from: u8, to: u8, energy: i64) -> ActionKind {
        ActionKind::Move {
            from: entity(from),
            to: entity(to),
            energy: Scalar::from_i64(energy),
            silver: Scalar::zero(),
        }
    }

    #[test]
    fn speculative_effects_stack_per_entity() {
        let mut overlay = ActionOverlay::new(60, 600);
        overlay.submit(move_kind(1, 2, 100), 0);
        overlay.submit(move_kind(1, 3, 50), 1);

        let effect = overlay.speculative_effect_on(entity(1));
        assert_eq!(effect.energy_delta, Scalar::from_i64(-150));
        assert_eq!(overlay.pending_for(entity(1)).len(), 2);
        assert_eq!(overlay.pending_for(entity(2)).len(), 1);
    }

    #[test]
    fn retiring_one_action_leaves_others() {
        let mut overlay = ActionOverlay::new(60, 600);
        let first = overlay.submit(move_kind(1, 2, 100), 0);
        overlay.submit(move_kind(1, 3, 50), 1);

        assert_eq!(overlay.on_confirmed(first.id), RetireOutcome::Retired);
        assert_eq!(first.events.recv().expect("event"), ActionLifecycle::Confirmed);

        let effect = overlay.speculative_effect_on(entity(1));
        assert_eq!(effect.energy_delta, Scalar::from_i64(-50));
        assert_eq!(overlay.pending_for(entity(1)).len(), 1);
    }

    #[test]
    fn retirement_is_idempotent() {
        let mut overlay = ActionOverlay::new(60, 600);
        let handle = overlay.submit(move_kind(1, 2, 100), 0);

        assert_eq!(overlay.on_confirmed(handle.id), RetireOutcome::Retired);
        assert_eq!(overlay.on_confirmed(handle.id), RetireOutcome::Unknown);
        assert_eq!(overlay.on_failed(handle.id, "dup"), RetireOutcome::Unknown);

        // Exactly one notification was delivered.
        assert_eq!(handle.events.recv().expect("event"), ActionLifecycle::Confirmed);
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn timeout_then_late_confirmation_fires_both_notices_once() {
        let mut overlay = ActionOverlay::new(60, 600);
        let handle = overlay.submit(move_kind(1, 2, 100), 0);

        let timed_out = overlay.tick(60);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].0, handle.id);
        assert_eq!(timed_out[0].1, vec![entity(1), entity(2)]);
        assert_eq!(overlay.active_count(), 0);
        assert_eq!(overlay.parked_count(), 1);
        // The speculative effect is withdrawn on timeout.
        assert_eq!(
            overlay.speculative_effect_on(entity(1)),
            SpeculativeEffect::default()
        );

        assert_eq!(overlay.on_confirmed(handle.id), RetireOutcome::RetiredLate);
        assert_eq!(overlay.on_confirmed(handle.id), RetireOutcome::Unknown);

        assert_eq!(handle.events.recv().expect("first"), ActionLifecycle::TimedOut);
        assert_eq!(handle.events.recv().expect("second"), ActionLifecycle::Confirmed);
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn parked_entries_expire() {
        let mut overlay = ActionOverlay::new(60, 600);
        let handle = overlay.submit(move_kind(1, 2, 100), 0);
        overlay.tick(60);
        assert_eq!(overlay.parked_count(), 1);

        overlay.tick(661);
        assert_eq!(overlay.parked_count(), 0);
        assert_eq!(overlay.on_confirmed(handle.id), RetireOutcome::Unknown);
    }

    #[test]
    fn failure_surfaces_reason() {
        let mut overlay = ActionOverlay::new(60, 600);
        let handle = overlay.submit(move_kind(1, 2, 100), 0);
        overlay.on_failed(handle.id, "insufficient energy");
        assert_eq!(
            handle.events.recv().expect("event"),
            ActionLifecycle::Failed {
                reason: "insufficient energy".to_string()
            }
        );
    }

    #[test]
    fn transfer_shows_pending_owner() {
        let mut overlay = ActionOverlay::new(60, 600);
        let recipient = Address([9u8; 20]);
        overlay.submit(
            ActionKind::Transfer {
                target: entity(4),
                recipient,
            },
            0,
        );
        let effect = overlay.speculative_effect_on(entity(4));
        assert_eq!(effect.pending_owner, Some(recipient));
    }
}
