//! Shard registry
//!
//! Concurrency-safe map from shard ID to `ShardStatus`. Shard sync adds and
//! removes entries as the stream topology changes; the engine reads them.
//! A missing entry is a normal answer, never a fault.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::status::ShardStatus;
use crate::discovery::ShardDescriptor;

/// Entries added and removed by a reconcile pass
#[derive(Debug, Default)]
pub struct SyncDelta {
    pub added: Vec<String>,
    pub removed: Vec<Arc<ShardStatus>>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Registry of every shard this worker knows about
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<String, Arc<ShardStatus>>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a shard unless it is already known; returns the registered entry
    pub fn insert(&self, status: ShardStatus) -> Arc<ShardStatus> {
        let mut shards = self.shards.write();
        shards
            .entry(status.id().to_string())
            .or_insert_with(|| Arc::new(status))
            .clone()
    }

    pub fn get(&self, shard_id: &str) -> Option<Arc<ShardStatus>> {
        self.shards.read().get(shard_id).cloned()
    }

    pub fn remove(&self, shard_id: &str) -> Option<Arc<ShardStatus>> {
        self.shards.write().remove(shard_id)
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.read().contains_key(shard_id)
    }

    /// Known shard IDs in ascending order.
    ///
    /// Only the IDs are copied; callers look each entry up again and must
    /// tolerate it having been removed in the meantime.
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shards.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Make the registry membership match the listed topology
    pub fn reconcile(&self, listed: &[ShardDescriptor]) -> SyncDelta {
        let mut delta = SyncDelta::default();
        let mut shards = self.shards.write();

        for descriptor in listed {
            if !shards.contains_key(&descriptor.shard_id) {
                shards.insert(
                    descriptor.shard_id.clone(),
                    Arc::new(ShardStatus::new(
                        descriptor.shard_id.clone(),
                        descriptor.parent_shard_ids.clone(),
                    )),
                );
                delta.added.push(descriptor.shard_id.clone());
            }
        }

        let stale: Vec<String> = shards
            .keys()
            .filter(|id| !listed.iter().any(|d| &d.shard_id == *id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(status) = shards.remove(&id) {
                delta.removed.push(status);
            }
        }

        if !delta.is_empty() {
            debug!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                "Shard registry reconciled"
            );
        }
        delta
    }
}
