//! Shard topology source
//!
//! Lists the shards that currently exist in the stream. The assignment loop
//! reconciles the registry against this list at the start of every tick.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// A shard as reported by the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub parent_shard_ids: Vec<String>,
}

impl ShardDescriptor {
    pub fn new(shard_id: impl Into<String>, parent_shard_ids: Vec<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids,
        }
    }
}

/// Source of the current shard topology
#[async_trait]
pub trait ShardDiscovery: Send + Sync {
    async fn list_shards(&self) -> Result<Vec<ShardDescriptor>>;
}

/// Topology held in memory and replaced wholesale to simulate splits/merges
#[derive(Debug, Default)]
pub struct StaticShardDiscovery {
    shards: RwLock<Vec<ShardDescriptor>>,
}

impl StaticShardDiscovery {
    pub fn new(shards: Vec<ShardDescriptor>) -> Self {
        Self {
            shards: RwLock::new(shards),
        }
    }

    /// Root shards `prefix-0000 .. prefix-{count-1}` with no parents
    pub fn with_count(prefix: &str, count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| ShardDescriptor::new(format!("{}-{:04}", prefix, i), vec![]))
                .collect(),
        )
    }

    pub fn set_shards(&self, shards: Vec<ShardDescriptor>) {
        *self.shards.write() = shards;
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.read().iter().map(|d| d.shard_id.clone()).collect()
    }
}

#[async_trait]
impl ShardDiscovery for StaticShardDiscovery {
    async fn list_shards(&self) -> Result<Vec<ShardDescriptor>> {
        Ok(self.shards.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_listing() {
        let discovery = StaticShardDiscovery::with_count("shard", 3);
        let listed = discovery.list_shards().await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[2].shard_id, "shard-0002");

        discovery.set_shards(vec![ShardDescriptor::new("shard-0003", vec!["shard-0000".into()])]);
        assert_eq!(discovery.shard_ids(), vec!["shard-0003"]);
    }
}
