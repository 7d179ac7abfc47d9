//! Worker membership
//!
//! There is no registration service: the fleet is whoever holds an
//! unexpired lease, plus this worker. Membership changes are detected by
//! comparing successive observations.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

use crate::partition::ShardSnapshot;

/// Workers observed holding a live lease, always including `local_worker`
pub fn active_workers<'a, I>(snapshots: I, now: DateTime<Utc>, local_worker: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a ShardSnapshot>,
{
    let mut workers: BTreeSet<String> = snapshots
        .into_iter()
        .filter_map(|s| s.active_owner(now))
        .map(str::to_string)
        .collect();
    workers.insert(local_worker.to_string());
    workers
}

/// Remembers the last observed worker set
#[derive(Debug, Default)]
pub struct MembershipTracker {
    last: Mutex<BTreeSet<String>>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `workers`; returns true if the set differs from the last one
    pub fn observe(&self, workers: BTreeSet<String>) -> bool {
        let mut last = self.last.lock();
        if *last == workers {
            return false;
        }

        let joined: Vec<&String> = workers.difference(&last).collect();
        let left: Vec<&String> = last.difference(&workers).collect();
        info!(?joined, ?left, active = workers.len(), "Worker membership changed");

        *last = workers;
        true
    }
}
