use std::path::PathBuf;

/// Tuning knobs for the client engine. Unlike [`crate::constants`], none
/// of these affect ledger agreement; they only shape local behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads in the chunk generation pool.
    pub worker_count: usize,
    /// Side length of the tiles the pool dispatches. Power of two.
    pub tile_side: u32,
    /// Ceiling for chunk consolidation in the cache. Power of two.
    pub max_chunk_side: u32,
    /// Cache capacity, counted in chunks.
    pub cache_capacity_chunks: usize,
    /// Seconds before a submitted action is announced as timed out.
    pub action_timeout_secs: u64,
    /// How long a timed-out action stays parked awaiting a late
    /// confirmation, as a multiple of the timeout.
    pub parked_retention_factor: u64,
    /// Reordering window for live events, counted in events.
    pub reorder_window: usize,
    /// Batch size for catch-up fetches.
    pub catch_up_batch: usize,
    /// Directory holding the persisted chunk cache and checkpoint.
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            tile_side: 16,
            max_chunk_side: 256,
            cache_capacity_chunks: 4_096,
            action_timeout_secs: 90,
            parked_retention_factor: 10,
            reorder_window: 512,
            catch_up_batch: 256,
            data_dir: PathBuf::from("deepfield-data"),
        }
    }
}

impl EngineConfig {
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("chunks.bin")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.bin")
    }

    pub fn parked_retention_secs(&self) -> u64 {
        self.action_timeout_secs * self.parked_retention_factor
    }
}
