#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ledger_proto::{Address, Checkpoint, EntityId, EventKey, LedgerEvent};
use universe_core::reconcile::{EventSource, SourceError};
use universe_core::{
    Coord, DiscoveredBody, EngineConfig, Footprint, FormulaConstants, Oracle, UniverseEngine,
};

pub const PLAYER: Address = Address([1u8; 20]);

#[derive(Default)]
struct LedgerState {
    history: Vec<LedgerEvent>,
    live: VecDeque<Vec<LedgerEvent>>,
    owned: Vec<EntityId>,
    down: bool,
}

/// Scriptable in-memory ledger shared between a test and the engine's
/// event source.
#[derive(Clone, Default)]
pub struct SharedLedger(Arc<Mutex<LedgerState>>);

impl SharedLedger {
    pub fn push_history(&self, event: LedgerEvent) {
        self.0.lock().expect("ledger mutex").history.push(event);
    }

    pub fn push_live(&self, batch: Vec<LedgerEvent>) {
        self.0.lock().expect("ledger mutex").live.push_back(batch);
    }

    pub fn set_owned(&self, owned: Vec<EntityId>) {
        self.0.lock().expect("ledger mutex").owned = owned;
    }

    pub fn set_down(&self, down: bool) {
        self.0.lock().expect("ledger mutex").down = down;
    }

    pub fn source(&self) -> Box<dyn EventSource> {
        Box::new(SharedSource(Arc::clone(&self.0)))
    }
}

struct SharedSource(Arc<Mutex<LedgerState>>);

impl EventSource for SharedSource {
    fn head(&mut self) -> Result<EventKey, SourceError> {
        let state = self.0.lock().expect("ledger mutex");
        if state.down {
            return Err(SourceError::Unavailable("ledger down".to_string()));
        }
        Ok(state
            .history
            .last()
            .map(|event| event.key)
            .unwrap_or_default())
    }

    fn fetch_after(
        &mut self,
        checkpoint: Checkpoint,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, SourceError> {
        let state = self.0.lock().expect("ledger mutex");
        if state.down {
            return Err(SourceError::Unavailable("ledger down".to_string()));
        }
        Ok(state
            .history
            .iter()
            .filter(|event| !checkpoint.covers(event.key))
            .take(limit)
            .cloned()
            .collect())
    }

    fn poll_live(&mut self) -> Result<Vec<LedgerEvent>, SourceError> {
        let mut state = self.0.lock().expect("ledger mutex");
        if state.down {
            return Err(SourceError::Unavailable("ledger down".to_string()));
        }
        Ok(state.live.pop_front().unwrap_or_default())
    }

    fn owned_entities(&mut self, _owner: Address) -> Result<Vec<EntityId>, SourceError> {
        let state = self.0.lock().expect("ledger mutex");
        if state.down {
            return Err(SourceError::Unavailable("ledger down".to_string()));
        }
        Ok(state.owned.clone())
    }
}

fn data_dir_for(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("deepfield-it-{}-{}", tag, std::process::id()))
}

pub fn test_config(tag: &str) -> EngineConfig {
    EngineConfig {
        worker_count: 2,
        action_timeout_secs: 60,
        data_dir: data_dir_for(tag),
        ..EngineConfig::default()
    }
}

/// A freshly initialized engine with a wiped data directory.
pub fn fresh_engine(tag: &str, ledger: &SharedLedger) -> UniverseEngine {
    let config = test_config(tag);
    let _ = std::fs::remove_dir_all(&config.data_dir);
    let mut engine =
        UniverseEngine::new(config, FormulaConstants::builtin(), ledger.source(), PLAYER);
    engine.init().expect("engine init");
    engine
}

/// An engine resuming from whatever the previous run persisted.
pub fn resumed_engine(tag: &str, ledger: &SharedLedger) -> UniverseEngine {
    let mut engine = UniverseEngine::new(
        test_config(tag),
        FormulaConstants::builtin(),
        ledger.source(),
        PLAYER,
    );
    engine.init().expect("engine init");
    engine
}

/// The first procedurally existing body scanning up from the origin, with
/// an aligned tile footprint that contains it.
pub fn find_body_footprint() -> (DiscoveredBody, Footprint) {
    let oracle = Oracle::new(Arc::new(FormulaConstants::builtin()));
    let mut x = 0i64;
    loop {
        if let Some(body) = oracle.body_at(Coord::new(x, 7)) {
            let footprint = Footprint::aligned(body.location.coord, 16);
            return (body, footprint);
        }
        x += 1;
    }
}

/// Explore a footprint to completion and merge the discoveries into the
/// store.
pub fn discover_region(engine: &mut UniverseEngine, footprint: Footprint, now: u64) {
    let handle = engine.explore_region(footprint, universe_core::RarityTier::MIN);
    let (_, failed) = handle.collect_blocking();
    assert!(failed.is_empty(), "degraded tiles in test region");
    engine.tick(now);
}
