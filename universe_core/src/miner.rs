//! Parallel application of the oracle over rectangular regions.
//!
//! A fixed pool of worker threads pulls tile jobs from a scheduler thread
//! that owns the priority queue. Workers share nothing mutable beyond the
//! chunk cache; tiles already dispatched always run to completion and
//! populate the cache even when their explore call is cancelled or
//! outprioritized.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::cache::ExploredChunkCache;
use crate::chunks::{Chunk, Footprint};
use crate::entity::{Coord, DiscoveredBody, RarityTier};
use crate::metrics::EngineMetrics;
use crate::oracle::{NoiseChannel, Oracle};

/// Updates streamed back to the issuer of an `explore` call.
#[derive(Clone, PartialEq, Debug)]
pub enum ExploreUpdate {
    Discovered(DiscoveredBody),
    TileDone(Footprint),
    /// The tile crashed twice; the region degrades to partial results
    /// instead of failing the whole explore.
    TileFailed(Footprint),
    Completed,
}

/// Cancellation token shared between an [`ExploreHandle`] and the
/// scheduler.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Handle for one explore call: a finite stream of updates plus its
/// cancellation token. Cancellation stops dispatch of not-yet-started
/// tiles only.
pub struct ExploreHandle {
    pub id: u64,
    pub updates: Receiver<ExploreUpdate>,
    cancel: CancelToken,
    commands: Sender<PoolCommand>,
}

impl ExploreHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.commands.send(PoolCommand::Cancel(self.id));
    }

    /// Drain the stream until completion, returning the discovered bodies
    /// and the tiles that failed.
    pub fn collect_blocking(&self) -> (Vec<DiscoveredBody>, Vec<Footprint>) {
        let mut bodies = Vec::new();
        let mut failed = Vec::new();
        for update in self.updates.iter() {
            match update {
                ExploreUpdate::Discovered(body) => bodies.push(body),
                ExploreUpdate::TileFailed(tile) => failed.push(tile),
                ExploreUpdate::TileDone(_) => {}
                ExploreUpdate::Completed => break,
            }
        }
        (bodies, failed)
    }
}

enum PoolCommand {
    Explore {
        id: u64,
        footprint: Footprint,
        rarity_floor: RarityTier,
        updates: Sender<ExploreUpdate>,
        cancel: CancelToken,
    },
    Cancel(u64),
    SetFocus(Coord),
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
struct TileJob {
    explore_id: u64,
    tile: Footprint,
    attempt: u8,
}

enum TileOutcome {
    Done { job: TileJob, chunk: Chunk },
    Panicked { job: TileJob },
}

/// Heap entry; closest-to-focus pops first, FIFO among equals.
struct QueuedJob {
    priority: i128,
    seq: u64,
    job: TileJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the nearest, oldest job.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ExploreState {
    footprint: Footprint,
    rarity_floor: RarityTier,
    updates: Sender<ExploreUpdate>,
    cancel: CancelToken,
    outstanding: usize,
}

/// Derive one tile. Pure; runs on worker threads.
fn derive_tile(oracle: &Oracle, tile: Footprint, metrics: &EngineMetrics) -> Chunk {
    let bodies: Vec<DiscoveredBody> = tile.coords().filter_map(|c| oracle.body_at(c)).collect();
    EngineMetrics::add(&metrics.coordinates_derived, tile.area());
    let density = oracle.noise_at(tile.center(), NoiseChannel::Zone);
    Chunk::assemble(tile, bodies, density)
}

fn worker_loop(
    index: usize,
    oracle: Arc<Oracle>,
    cache: Arc<Mutex<ExploredChunkCache>>,
    jobs: Receiver<TileJob>,
    outcomes: Sender<TileOutcome>,
    metrics: Arc<EngineMetrics>,
) {
    for job in jobs.iter() {
        let result = catch_unwind(AssertUnwindSafe(|| derive_tile(&oracle, job.tile, &metrics)));
        let outcome = match result {
            Ok(chunk) => {
                // Last write wins; racing workers produce identical
                // chunks for the same footprint.
                cache
                    .lock()
                    .expect("chunk cache mutex poisoned")
                    .store(chunk.clone());
                EngineMetrics::bump(&metrics.tiles_mined);
                TileOutcome::Done { job, chunk }
            }
            Err(_) => {
                error!(
                    target: "deepfield::miner",
                    worker = index,
                    tile = %job.tile,
                    "tile derivation panicked"
                );
                TileOutcome::Panicked { job }
            }
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

struct Scheduler {
    tile_side: u32,
    worker_count: usize,
    focus: Coord,
    queue: std::collections::BinaryHeap<QueuedJob>,
    next_seq: u64,
    in_flight: usize,
    explores: HashMap<u64, ExploreState>,
    commands: Receiver<PoolCommand>,
    jobs: Sender<TileJob>,
    outcomes: Receiver<TileOutcome>,
    cache: Arc<Mutex<ExploredChunkCache>>,
    discoveries: Sender<DiscoveredBody>,
    metrics: Arc<EngineMetrics>,
}

impl Scheduler {
    fn run(mut self) {
        loop {
            self.dispatch_ready();
            select! {
                recv(self.commands) -> command => match command {
                    Ok(PoolCommand::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(self.outcomes) -> outcome => match outcome {
                    Ok(outcome) => self.handle_outcome(outcome),
                    Err(_) => break,
                },
            }
        }
        // Dropping the job sender stops the workers.
    }

    fn priority_of(&self, tile: &Footprint) -> i128 {
        tile.center().dist2(self.focus)
    }

    fn push_job(&mut self, job: TileJob) {
        let priority = self.priority_of(&job.tile);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedJob { priority, seq, job });
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Explore {
                id,
                footprint,
                rarity_floor,
                updates,
                cancel,
            } => {
                let tiles = footprint.covering_tiles(self.tile_side);
                info!(
                    target: "deepfield::miner",
                    explore = id,
                    footprint = %footprint,
                    tiles = tiles.len(),
                    "explore started"
                );
                let state = ExploreState {
                    footprint,
                    rarity_floor,
                    updates,
                    cancel,
                    outstanding: tiles.len(),
                };
                if state.outstanding == 0 {
                    let _ = state.updates.send(ExploreUpdate::Completed);
                    return;
                }
                self.explores.insert(id, state);
                for tile in tiles {
                    self.push_job(TileJob {
                        explore_id: id,
                        tile,
                        attempt: 0,
                    });
                }
            }
            PoolCommand::Cancel(id) => {
                if self.explores.remove(&id).is_some() {
                    debug!(target: "deepfield::miner", explore = id, "explore cancelled");
                }
            }
            PoolCommand::SetFocus(focus) => {
                self.focus = focus;
                // Reorder everything still queued; in-flight tiles are
                // left alone.
                let drained: Vec<TileJob> = self
                    .queue
                    .drain()
                    .map(|queued| queued.job)
                    .collect();
                for job in drained {
                    self.push_job(job);
                }
            }
            PoolCommand::Shutdown => {}
        }
    }

    fn dispatch_ready(&mut self) {
        while self.in_flight < self.worker_count {
            let Some(queued) = self.queue.pop() else {
                break;
            };
            let job = queued.job;
            let Some(state) = self.explores.get(&job.explore_id) else {
                continue;
            };
            if state.cancel.is_cancelled() {
                self.explores.remove(&job.explore_id);
                continue;
            }
            // Coalescing: a queued tile already covered by completed
            // chunks is served from the cache without dispatch.
            let cached = {
                let mut cache = self.cache.lock().expect("chunk cache mutex poisoned");
                cache.bodies_within(&job.tile)
            };
            if let Some(bodies) = cached {
                EngineMetrics::bump(&self.metrics.tiles_served_from_cache);
                // Cached bodies still flow to the store merge channel; a
                // restart may have reloaded chunks the store never saw.
                for body in &bodies {
                    let _ = self.discoveries.send(*body);
                }
                self.deliver_tile(job, &bodies);
                continue;
            }
            if self.jobs.send(job).is_err() {
                warn!(target: "deepfield::miner", "worker pool unavailable");
                break;
            }
            self.in_flight += 1;
        }
    }

    fn handle_outcome(&mut self, outcome: TileOutcome) {
        match outcome {
            TileOutcome::Done { job, chunk } => {
                self.in_flight -= 1;
                for body in &chunk.bodies {
                    let _ = self.discoveries.send(*body);
                }
                self.deliver_tile(job, &chunk.bodies);
            }
            TileOutcome::Panicked { job } => {
                self.in_flight -= 1;
                if job.attempt == 0 {
                    EngineMetrics::bump(&self.metrics.tiles_retried);
                    self.push_job(TileJob {
                        attempt: 1,
                        ..job
                    });
                } else {
                    EngineMetrics::bump(&self.metrics.tiles_failed);
                    warn!(
                        target: "deepfield::miner",
                        tile = %job.tile,
                        "tile failed twice, degrading region"
                    );
                    self.finish_tile(job, Some(ExploreUpdate::TileFailed(job.tile)));
                }
            }
        }
    }

    /// Stream a completed tile's bodies to its explore, then mark the
    /// tile done.
    fn deliver_tile(&mut self, job: TileJob, bodies: &[DiscoveredBody]) {
        let (updates, rarity_floor, footprint, cancel) = match self.explores.get(&job.explore_id) {
            Some(state) => (
                state.updates.clone(),
                state.rarity_floor,
                state.footprint,
                state.cancel.clone(),
            ),
            None => return,
        };
        if cancel.is_cancelled() {
            self.explores.remove(&job.explore_id);
            return;
        }
        for body in bodies {
            if body.statics.tier < rarity_floor {
                continue;
            }
            if !footprint.contains(body.location.coord) {
                continue;
            }
            if updates.send(ExploreUpdate::Discovered(*body)).is_err() {
                self.explores.remove(&job.explore_id);
                return;
            }
        }
        self.finish_tile(job, Some(ExploreUpdate::TileDone(job.tile)));
    }

    fn finish_tile(&mut self, job: TileJob, notice: Option<ExploreUpdate>) {
        let Some(state) = self.explores.get_mut(&job.explore_id) else {
            return;
        };
        if let Some(notice) = notice {
            if state.updates.send(notice).is_err() {
                self.explores.remove(&job.explore_id);
                return;
            }
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            let _ = state.updates.send(ExploreUpdate::Completed);
            self.explores.remove(&job.explore_id);
        }
    }
}

/// Bounded worker pool for chunk generation.
pub struct MinerPool {
    commands: Sender<PoolCommand>,
    discoveries: Receiver<DiscoveredBody>,
    next_explore: u64,
    scheduler: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl MinerPool {
    pub fn start(
        worker_count: usize,
        tile_side: u32,
        oracle: Arc<Oracle>,
        cache: Arc<Mutex<ExploredChunkCache>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (command_tx, command_rx) = unbounded();
        let (job_tx, job_rx) = bounded(worker_count);
        let (outcome_tx, outcome_rx) = unbounded();
        let (discovery_tx, discovery_rx) = unbounded();

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let oracle = Arc::clone(&oracle);
            let cache = Arc::clone(&cache);
            let jobs = job_rx.clone();
            let outcomes = outcome_tx.clone();
            let metrics = Arc::clone(&metrics);
            workers.push(thread::spawn(move || {
                worker_loop(index, oracle, cache, jobs, outcomes, metrics)
            }));
        }
        drop(outcome_tx);

        let scheduler = Scheduler {
            tile_side,
            worker_count,
            focus: Coord::new(0, 0),
            queue: std::collections::BinaryHeap::new(),
            next_seq: 0,
            in_flight: 0,
            explores: HashMap::new(),
            commands: command_rx,
            jobs: job_tx,
            outcomes: outcome_rx,
            cache,
            discoveries: discovery_tx,
            metrics,
        };
        let scheduler = thread::spawn(move || scheduler.run());

        Self {
            commands: command_tx,
            discoveries: discovery_rx,
            next_explore: 1,
            scheduler: Some(scheduler),
            workers,
        }
    }

    /// Start exploring a footprint. Non-blocking: tile computation
    /// proceeds asynchronously and reports through the returned handle.
    pub fn explore(&mut self, footprint: Footprint, rarity_floor: RarityTier) -> ExploreHandle {
        let id = self.next_explore;
        self.next_explore += 1;
        let (update_tx, update_rx) = unbounded();
        let cancel = CancelToken::default();
        let command = PoolCommand::Explore {
            id,
            footprint,
            rarity_floor,
            updates: update_tx,
            cancel: cancel.clone(),
        };
        if self.commands.send(command).is_err() {
            warn!(target: "deepfield::miner", "explore issued after pool shutdown");
        }
        ExploreHandle {
            id,
            updates: update_rx,
            cancel,
            commands: self.commands.clone(),
        }
    }

    /// Move the scheduling focal point; queued tiles nearest the focus
    /// dispatch first.
    pub fn set_focus(&self, focus: Coord) {
        let _ = self.commands.send(PoolCommand::SetFocus(focus));
    }

    /// Bodies derived since the last drain, for merge into the
    /// world-state store.
    pub fn drain_discoveries(&self) -> Vec<DiscoveredBody> {
        self.discoveries.try_iter().collect()
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(PoolCommand::Shutdown);
        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for MinerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
