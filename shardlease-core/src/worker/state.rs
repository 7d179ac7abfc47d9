//! Worker state
//!
//! Lifecycle phase and the set of shards this worker is actively renewing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::coordinator::renewal::RenewalExit;
use crate::metrics::standard;

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Constructed, loops not started
    Initializing,
    /// Assignment, renewal and rebalance loops running
    Running,
    /// Releasing leases and stopping loops
    ShuttingDown,
    /// All tasks finished
    Stopped,
}

struct OwnedLease {
    generation: u64,
    handle: JoinHandle<RenewalExit>,
}

/// Shards with a live renewal task on this worker
#[derive(Default)]
pub struct OwnedShards {
    shards: Mutex<HashMap<String, OwnedLease>>,
    next_generation: AtomicU64,
}

impl OwnedShards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a renewal task unless one is already running for the shard.
    ///
    /// `spawn` receives the generation the task must pass to `finish`. It
    /// runs under the lock, so a task that exits immediately cannot
    /// unregister before it was registered.
    pub fn start<F>(&self, shard_id: &str, spawn: F) -> bool
    where
        F: FnOnce(u64) -> JoinHandle<RenewalExit>,
    {
        let mut shards = self.shards.lock();
        if shards.contains_key(shard_id) {
            return false;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = spawn(generation);
        shards.insert(shard_id.to_string(), OwnedLease { generation, handle });
        standard::OWNED_LEASES.inc();
        true
    }

    /// Unregister the task of `generation`; a newer task for the same shard
    /// is left alone
    pub fn finish(&self, shard_id: &str, generation: u64) {
        let mut shards = self.shards.lock();
        if shards.get(shard_id).map(|o| o.generation) == Some(generation) {
            shards.remove(shard_id);
            standard::OWNED_LEASES.dec();
        }
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.lock().contains_key(shard_id)
    }

    pub fn len(&self) -> usize {
        self.shards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.lock().is_empty()
    }

    /// Owned shard IDs in ascending order
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shards.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take every task handle, leaving the set empty
    pub fn drain(&self) -> Vec<(String, JoinHandle<RenewalExit>)> {
        let drained: Vec<_> = self
            .shards
            .lock()
            .drain()
            .map(|(id, owned)| (id, owned.handle))
            .collect();
        for _ in &drained {
            standard::OWNED_LEASES.dec();
        }
        drained
    }
}
