//! Shared lease context
//!
//! Everything the assignment loop, the renewal tasks and the rebalancer
//! of one worker share.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::membership::MembershipTracker;
use super::renewal::spawn_renewal_loop;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::metrics::standard;
use crate::partition::{ShardRegistry, ShardStatus};
use crate::runtime::ShutdownSignal;
use crate::store::{bounded, ClaimCondition, ClaimOutcome, LeaseRecord, LeaseStore};
use crate::worker::processor::ShardProcessor;
use crate::worker::state::OwnedShards;

/// Shared context for all loops of a worker
pub struct LeaseContext {
    pub config: WorkerConfig,
    pub store: Arc<dyn LeaseStore>,
    pub registry: Arc<ShardRegistry>,
    pub processor: Arc<dyn ShardProcessor>,
    pub owned: OwnedShards,
    pub shutdown: ShutdownSignal,
    pub membership: MembershipTracker,
    /// Wakes the rebalancer ahead of its period
    pub rebalance_trigger: Notify,
}

impl LeaseContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn LeaseStore>,
        registry: Arc<ShardRegistry>,
        processor: Arc<dyn ShardProcessor>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            processor,
            owned: OwnedShards::new(),
            shutdown: ShutdownSignal::new(),
            membership: MembershipTracker::new(),
            rebalance_trigger: Notify::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Expiry for a lease claimed or renewed now
    pub fn next_expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.config.lease_span()
    }

    /// Whether the worker already holds as many leases as it may
    pub fn at_capacity(&self) -> bool {
        self.owned.len() >= self.config.max_leases_for_worker
    }

    /// Authoritative read of a lease row
    pub async fn read_lease(&self, shard_id: &str) -> Result<Option<LeaseRecord>> {
        bounded(self.config.store_call_timeout, "get", shard_id, async {
            self.store.get(shard_id).await
        })
        .await
    }

    /// Conditional claim for this worker; returns the expiry written on success
    pub async fn claim(
        &self,
        shard_id: &str,
        condition: &ClaimCondition,
    ) -> Result<(ClaimOutcome, DateTime<Utc>)> {
        let expiry = self.next_expiry();
        let outcome = bounded(self.config.store_call_timeout, "claim", shard_id, async {
            self.store
                .conditional_claim(shard_id, self.worker_id(), expiry, condition)
                .await
        })
        .await?;
        Ok((outcome, expiry))
    }

    pub async fn renew(&self, shard_id: &str) -> Result<Option<DateTime<Utc>>> {
        let expiry = self.next_expiry();
        let renewed = bounded(self.config.store_call_timeout, "renew", shard_id, async {
            self.store
                .conditional_renew(shard_id, expiry, self.worker_id())
                .await
        })
        .await?;
        Ok(renewed.then_some(expiry))
    }

    pub async fn remove_owner(&self, shard_id: &str) -> Result<bool> {
        bounded(self.config.store_call_timeout, "remove_owner", shard_id, async {
            self.store
                .conditional_remove_owner(shard_id, self.worker_id())
                .await
        })
        .await
    }

    pub async fn persist_checkpoint(&self, shard_id: &str, checkpoint: &str) -> Result<bool> {
        bounded(self.config.store_call_timeout, "checkpoint", shard_id, async {
            self.store
                .checkpoint(shard_id, checkpoint, self.worker_id())
                .await
        })
        .await
    }

    /// Record a won claim and start processing and renewing the shard
    pub async fn take_ownership(
        self: &Arc<Self>,
        status: &ShardStatus,
        expiry: DateTime<Utc>,
        checkpoint: Option<String>,
    ) {
        let shard_id = status.id().to_string();
        if self.shutdown.is_shutdown() {
            // Claim raced with shutdown; hand the lease straight back
            match self.remove_owner(&shard_id).await {
                Ok(_) => debug!(
                    worker_id = self.worker_id(),
                    shard_id = %shard_id,
                    "Claim raced shutdown, lease handed back"
                ),
                Err(e) => warn!(
                    worker_id = self.worker_id(),
                    shard_id = %shard_id,
                    error = %e,
                    "Lease hand-back after late claim failed"
                ),
            }
            return;
        }
        status.set_lease(self.worker_id(), expiry);

        let ctx = self.clone();
        let started = self.owned.start(&shard_id, |generation| {
            spawn_renewal_loop(ctx, shard_id.clone(), generation)
        });
        if !started {
            return;
        }

        info!(
            worker_id = self.worker_id(),
            shard_id = %shard_id,
            lease_timeout = %expiry,
            "Acquired shard lease"
        );
        self.processor
            .on_acquired(&shard_id, checkpoint.as_deref())
            .await;
    }

    /// Count a failed store call
    pub fn record_store_error(&self) {
        standard::STORE_ERRORS.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;
    use crate::worker::processor::RecordingProcessor;

    #[tokio::test]
    async fn test_claim_after_shutdown_is_handed_back() {
        let store = Arc::new(InMemoryLeaseStore::with_shards(["shard-0001"]));
        let registry = Arc::new(ShardRegistry::new());
        let status = registry.insert(ShardStatus::new("shard-0001", vec![]));
        let processor = Arc::new(RecordingProcessor::new());
        let ctx = Arc::new(LeaseContext::new(
            WorkerConfig::with_worker_id("worker-a"),
            store.clone(),
            registry,
            processor.clone(),
        ));

        let (outcome, expiry) = ctx.claim("shard-0001", &ClaimCondition::Unowned).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        ctx.shutdown.shutdown();
        ctx.take_ownership(&status, expiry, None).await;

        assert_eq!(store.record("shard-0001").unwrap().lease_owner, None);
        assert!(!ctx.owned.contains("shard-0001"));
        assert!(processor.events().is_empty());
    }
}
