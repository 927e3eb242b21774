//! Wire-level types shared between the client engine and the ledger
//! collaborator: typed events, event keys, checkpoints and the encoding
//! helpers used for local persistence.

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

/// Ledger account address, 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hash-derived entity identifier, 32 bytes.
///
/// For procedurally derived bodies this is the oracle digest of the
/// coordinate; for minted entities (voyages, artifacts) it is assigned by
/// the ledger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntityId(pub [u8; 32]);

impl EntityId {
    pub fn from_words(words: [u64; 4]) -> Self {
        let mut bytes = [0u8; 32];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_be_bytes());
        }
        Self(bytes)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Locally assigned identifier for a submitted action, echoed back by the
/// ledger in confirmation and failure events.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event in the ledger. Total order over all events.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct EventKey {
    pub block_height: u64,
    pub log_index: u32,
}

impl EventKey {
    pub fn new(block_height: u64, log_index: u32) -> Self {
        Self {
            block_height,
            log_index,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_height, self.log_index)
    }
}

/// Last ledger position fully applied to local state. `None` means genesis.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct Checkpoint {
    pub last_applied: Option<EventKey>,
}

impl Checkpoint {
    pub const GENESIS: Checkpoint = Checkpoint { last_applied: None };

    pub fn at(key: EventKey) -> Self {
        Self {
            last_applied: Some(key),
        }
    }

    /// Whether `key` falls at or before this checkpoint.
    pub fn covers(&self, key: EventKey) -> bool {
        match self.last_applied {
            Some(last) => key <= last,
            None => false,
        }
    }

    pub fn advance(&mut self, key: EventKey) {
        debug_assert!(!self.covers(key), "checkpoint moved backwards");
        self.last_applied = Some(key);
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_applied {
            Some(key) => write!(f, "{}", key),
            None => write!(f, "genesis"),
        }
    }
}

/// Confirmed dynamic attributes of an entity as stored on the ledger.
///
/// Resource quantities are raw fixed-point values (scale 1e6), matching
/// the arithmetic the engine replicates. `locked_until` of zero means no
/// active lockup.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct DynamicState {
    pub owner: Address,
    pub energy: i64,
    pub silver: i64,
    pub locked_until: u64,
    pub updated_at: u64,
}

/// An in-flight transfer between two bodies.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VoyagePayload {
    pub voyage_id: EntityId,
    pub player: Address,
    pub from: EntityId,
    pub to: EntityId,
    pub energy: i64,
    pub silver: i64,
    pub departure_time: u64,
    pub arrival_time: u64,
}

/// Typed ledger diff payloads.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub enum EventKind {
    /// A new entity created by a confirmed action rather than derived
    /// procedurally. The digest covers its static attributes so the client
    /// can cross-check its own derivation.
    EntityMinted {
        statics_digest: u64,
        tier: u8,
        zone: u8,
    },
    /// Authoritative replacement of an entity's dynamic attributes.
    SnapshotUpdated {
        dynamic: DynamicState,
        statics_digest: Option<u64>,
    },
    OwnerChanged {
        owner: Address,
        timestamp: u64,
    },
    VoyageQueued {
        voyage: VoyagePayload,
    },
    /// Settlement of a queued voyage onto the target entity.
    VoyageArrived {
        voyage_id: EntityId,
        energy_delivered: i64,
        silver_delivered: i64,
        timestamp: u64,
    },
    ActionConfirmed {
        action: ActionId,
    },
    ActionFailed {
        action: ActionId,
        reason: String,
    },
}

/// One confirmed ledger event.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct LedgerEvent {
    pub key: EventKey,
    pub entity_id: EntityId,
    pub kind: EventKind,
}

/// Deterministic 64-bit digest of any serializable value.
///
/// Fixed ahash seeds keep the digest stable across processes and runs so
/// it can be compared against ledger-provided digests.
pub fn digest_of<T: Serialize>(value: &T) -> u64 {
    let encoded = bincode::serialize(value).expect("digest serialization failed");
    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write(&encoded);
    hasher.finish()
}

pub fn encode_events(events: &[LedgerEvent]) -> bincode::Result<Vec<u8>> {
    bincode::serialize(events)
}

pub fn decode_events(data: &[u8]) -> bincode::Result<Vec<LedgerEvent>> {
    bincode::deserialize(data)
}

pub fn encode_events_json(events: &[LedgerEvent]) -> serde_json::Result<String> {
    serde_json::to_string(events)
}

pub fn decode_events_json(data: &str) -> serde_json::Result<Vec<LedgerEvent>> {
    serde_json::from_str(data)
}

pub fn encode_checkpoint(checkpoint: &Checkpoint) -> bincode::Result<Vec<u8>> {
    bincode::serialize(checkpoint)
}

pub fn decode_checkpoint(data: &[u8]) -> bincode::Result<Checkpoint> {
    bincode::deserialize(data)
}
