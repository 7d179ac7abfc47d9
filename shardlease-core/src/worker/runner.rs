//! Worker lifecycle
//!
//! Owns the shared lease context and the background tasks of one worker.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::processor::ShardProcessor;
use super::state::WorkerPhase;
use crate::config::WorkerConfig;
use crate::coordinator::event_loop::{run_tick, spawn_assignment_loop, TickReport};
use crate::coordinator::rebalancer::{rebalance_once, spawn_rebalance_loop, RebalanceReport};
use crate::coordinator::LeaseContext;
use crate::discovery::ShardDiscovery;
use crate::error::{LeaseError, Result};
use crate::partition::{ShardRegistry, ShardSnapshot};
use crate::store::{LeaseRecord, LeaseStore};

/// A lease-holding worker
pub struct Worker {
    ctx: Arc<LeaseContext>,
    discovery: Option<Arc<dyn ShardDiscovery>>,
    phase: Mutex<WorkerPhase>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker; nothing runs until `start`
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn LeaseStore>,
        processor: Arc<dyn ShardProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ShardRegistry::new());
        Ok(Self {
            ctx: Arc::new(LeaseContext::new(config, store, registry, processor)),
            discovery: None,
            phase: Mutex::new(WorkerPhase::Initializing),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Keep the registry in step with `discovery` at the start of each tick.
    ///
    /// Without a discovery source the registry is maintained by the caller
    /// through `registry()`.
    pub fn with_discovery(mut self, discovery: Arc<dyn ShardDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn worker_id(&self) -> &str {
        self.ctx.worker_id()
    }

    pub fn registry(&self) -> Arc<ShardRegistry> {
        self.ctx.registry.clone()
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.lock()
    }

    /// Shards this worker currently holds and renews, ascending
    pub fn owned_shards(&self) -> Vec<String> {
        self.ctx.owned.shard_ids()
    }

    /// Local view of a registered shard
    pub fn shard(&self, shard_id: &str) -> Result<ShardSnapshot> {
        self.ctx
            .registry
            .get(shard_id)
            .map(|status| status.snapshot())
            .ok_or_else(|| LeaseError::ShardNotFound {
                shard_id: shard_id.to_string(),
            })
    }

    /// Authoritative lease row for a shard
    pub async fn lease(&self, shard_id: &str) -> Result<LeaseRecord> {
        self.ctx
            .read_lease(shard_id)
            .await?
            .ok_or_else(|| LeaseError::LeaseNotFound {
                shard_id: shard_id.to_string(),
            })
    }

    /// Spawn the assignment loop and, when stealing is enabled, the
    /// rebalance loop. Renewal tasks are spawned per acquired shard.
    pub fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            WorkerPhase::Initializing => {}
            WorkerPhase::Running => return Ok(()),
            WorkerPhase::ShuttingDown | WorkerPhase::Stopped => {
                return Err(LeaseError::ShutdownInProgress)
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_assignment_loop(self.ctx.clone(), self.discovery.clone()));
        if self.ctx.config.enable_lease_stealing {
            tasks.push(spawn_rebalance_loop(self.ctx.clone()));
        }
        *phase = WorkerPhase::Running;

        info!(
            worker_id = self.worker_id(),
            stealing = self.ctx.config.enable_lease_stealing,
            "Worker started"
        );
        Ok(())
    }

    /// Run one assignment tick in the caller's task
    pub async fn run_assignment_tick(&self) -> TickReport {
        run_tick(&self.ctx, self.discovery.as_deref()).await
    }

    /// Run one rebalance pass in the caller's task
    pub async fn run_rebalance(&self) -> RebalanceReport {
        rebalance_once(&self.ctx).await
    }

    /// Stop every loop and hand back every owned lease.
    ///
    /// Leases whose hand-back fails are left to expire.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                WorkerPhase::Stopped => return Ok(()),
                WorkerPhase::ShuttingDown => return Err(LeaseError::ShutdownInProgress),
                WorkerPhase::Initializing | WorkerPhase::Running => {
                    *phase = WorkerPhase::ShuttingDown;
                }
            }
        }
        info!(worker_id = self.worker_id(), "Worker shutting down");
        self.ctx.shutdown.shutdown();

        let loops: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(worker_id = self.worker_id(), error = %e, "Worker loop panicked");
            }
        }

        let renewals = self.ctx.owned.drain();
        let released = renewals.len();
        for (shard_id, handle) in renewals {
            if let Err(e) = handle.await {
                error!(worker_id = self.worker_id(), shard_id = %shard_id, error = %e, "Renewal task panicked");
            }
        }

        *self.phase.lock() = WorkerPhase::Stopped;
        info!(worker_id = self.worker_id(), released, "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticShardDiscovery;
    use crate::store::InMemoryLeaseStore;
    use crate::worker::processor::{RecordingProcessor, ShardEvent};

    fn worker(store: Arc<InMemoryLeaseStore>, id: &str) -> (Worker, Arc<RecordingProcessor>) {
        let processor = Arc::new(RecordingProcessor::with_checkpoint("seq-7"));
        let worker = Worker::new(WorkerConfig::with_worker_id(id), store, processor.clone())
            .unwrap()
            .with_discovery(Arc::new(StaticShardDiscovery::with_count("shard", 3)));
        (worker, processor)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = WorkerConfig {
            lease_duration: std::time::Duration::ZERO,
            ..WorkerConfig::with_worker_id("worker-a")
        };
        let result = Worker::new(
            config,
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(RecordingProcessor::new()),
        );
        assert!(matches!(result, Err(LeaseError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_tick_then_shutdown_releases_everything() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (worker, processor) = worker(store.clone(), "worker-a");

        let report = worker.run_assignment_tick().await;
        assert_eq!(report.claimed.len(), 3);
        assert_eq!(worker.owned_shards(), vec!["shard-0000", "shard-0001", "shard-0002"]);

        worker.shutdown().await.unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Stopped);
        assert!(worker.owned_shards().is_empty());
        assert!(store.owners().is_empty());
        assert_eq!(store.record("shard-0001").unwrap().checkpoint.as_deref(), Some("seq-7"));
        assert_eq!(
            processor.events_for("shard-0001").last(),
            Some(&ShardEvent::Shutdown { shard_id: "shard-0001".into() })
        );
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (worker, _) = worker(store, "worker-a");

        worker.start().unwrap();
        worker.start().unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Running);

        worker.shutdown().await.unwrap();
        worker.shutdown().await.unwrap();
        assert!(matches!(worker.start(), Err(LeaseError::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn test_lookups_report_missing_entries() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (worker, _) = worker(store, "worker-a");

        assert!(matches!(worker.shard("shard-0000"), Err(LeaseError::ShardNotFound { .. })));
        assert!(matches!(
            worker.lease("shard-0000").await,
            Err(LeaseError::LeaseNotFound { .. })
        ));
        assert!(worker.lease("shard-0000").await.unwrap_err().is_missing_entry());

        worker.run_assignment_tick().await;
        assert_eq!(worker.shard("shard-0000").unwrap().lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(worker.lease("shard-0000").await.unwrap().lease_owner.as_deref(), Some("worker-a"));
        worker.shutdown().await.unwrap();
    }
}
