//! Assignment event loop
//!
//! Periodic scan over every known shard that claims the ones this worker
//! should own. Each shard is handled independently: a store failure or a
//! vanished registry entry skips that shard for this tick only.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::LeaseContext;
use super::membership::active_workers;
use crate::discovery::ShardDiscovery;
use crate::error::{LeaseError, Result};
use crate::metrics::standard;
use crate::partition::{StickyPolicy, SHARD_END};
use crate::store::{bounded, ClaimCondition, ClaimOutcome};

/// Why the assignment loop left a shard alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Sticky release request: nobody may acquire
    ReleaseRequested,
    /// Pinned to another worker, expired or not
    PinnedToOther,
    /// Live lease held by another worker
    HeldByOther,
}

/// What the assignment loop should do with a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Skip(SkipReason),
    Claim(ClaimCondition),
}

/// Decide whether `worker_id` may claim a shard.
///
/// `owner` and `expired` describe the lease as freshly read; `policy`
/// comes from the same read.
pub fn decide_acquisition(
    policy: StickyPolicy,
    owner: Option<&str>,
    expired: bool,
    worker_id: &str,
) -> Acquisition {
    match (policy, owner) {
        (StickyPolicy::ReleaseRequested, _) => Acquisition::Skip(SkipReason::ReleaseRequested),
        (_, None) => Acquisition::Claim(ClaimCondition::Unowned),
        (_, Some(current)) if current == worker_id => Acquisition::Claim(ClaimCondition::Renewal),
        (StickyPolicy::Pinned, Some(_)) => Acquisition::Skip(SkipReason::PinnedToOther),
        (StickyPolicy::Normal, Some(current)) if expired => Acquisition::Claim(ClaimCondition::Expired {
            owner: current.to_string(),
        }),
        (StickyPolicy::Normal, Some(_)) => Acquisition::Skip(SkipReason::HeldByOther),
    }
}

/// Summary of one assignment tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Shard IDs considered
    pub scanned: usize,
    /// Shards claimed this tick
    pub claimed: Vec<String>,
    /// Claims that lost the race
    pub conflicts: usize,
    /// Skipped by policy, ownership, or capacity
    pub skipped: usize,
    /// Already owned with a running renewal task
    pub already_owned: usize,
    /// Fully processed shards
    pub closed: usize,
    /// Entries removed from the registry mid-tick
    pub vanished: usize,
    /// Store calls that failed or timed out
    pub errors: usize,
}

/// Spawn the periodic assignment loop
pub fn spawn_assignment_loop(
    ctx: Arc<LeaseContext>,
    discovery: Option<Arc<dyn ShardDiscovery>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.subscribe();
        let mut interval = tokio::time::interval(ctx.config.shard_sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            let report = run_tick(&ctx, discovery.as_deref()).await;
            if !report.claimed.is_empty() || report.errors > 0 {
                debug!(worker_id = ctx.worker_id(), ?report, "Assignment tick finished");
            }
        }
        debug!(worker_id = ctx.worker_id(), "Assignment loop stopped");
    })
}

/// Run one assignment tick: sync topology, then try every known shard
pub async fn run_tick(ctx: &Arc<LeaseContext>, discovery: Option<&dyn ShardDiscovery>) -> TickReport {
    if let Some(discovery) = discovery {
        if let Err(e) = sync_shards(ctx, discovery).await {
            ctx.record_store_error();
            warn!(worker_id = ctx.worker_id(), error = %e, "Shard sync failed, scanning known shards");
        }
    }

    let mut report = TickReport::default();
    for shard_id in ctx.registry.shard_ids() {
        report.scanned += 1;
        consider_shard(ctx, &shard_id, &mut report).await;
    }

    observe_membership(ctx);
    report
}

async fn consider_shard(ctx: &Arc<LeaseContext>, shard_id: &str, report: &mut TickReport) {
    let worker_id = ctx.worker_id();

    if ctx.owned.contains(shard_id) {
        report.already_owned += 1;
        return;
    }
    let Some(status) = ctx.registry.get(shard_id) else {
        debug!(worker_id, shard_id, "Shard removed from registry, skipping");
        report.vanished += 1;
        return;
    };

    let record = match ctx.read_lease(shard_id).await {
        Ok(record) => record,
        Err(e) => {
            ctx.record_store_error();
            warn!(worker_id, shard_id, error = %e, "Reading lease failed, skipping shard this tick");
            report.errors += 1;
            return;
        }
    };
    if !ctx.registry.contains(shard_id) {
        debug!(worker_id, shard_id, "Shard removed from registry during read, skipping");
        report.vanished += 1;
        return;
    }
    status.apply_record(record.as_ref());

    let snapshot = status.snapshot();
    if snapshot.is_closed() {
        report.closed += 1;
        return;
    }

    let decision = decide_acquisition(
        snapshot.policy(),
        snapshot.lease_owner.as_deref(),
        snapshot.is_expired(Utc::now()),
        worker_id,
    );
    let condition = match decision {
        Acquisition::Skip(reason) => {
            debug!(worker_id, shard_id, ?reason, "Not acquiring shard");
            report.skipped += 1;
            return;
        }
        Acquisition::Claim(condition) => condition,
    };

    if ctx.at_capacity() {
        debug!(worker_id, shard_id, "At lease capacity, not acquiring");
        report.skipped += 1;
        return;
    }

    match ctx.claim(shard_id, &condition).await {
        Ok((ClaimOutcome::Claimed, expiry)) => {
            standard::LEASES_CLAIMED.inc();
            if let ClaimCondition::Expired { owner } = &condition {
                info!(worker_id, shard_id, previous_owner = %owner, "Took over expired lease");
            }
            ctx.take_ownership(&status, expiry, snapshot.checkpoint.clone()).await;
            report.claimed.push(shard_id.to_string());
        }
        Ok((ClaimOutcome::Conflict { current_owner }, _)) => {
            standard::CLAIM_CONFLICTS.inc();
            debug!(worker_id, shard_id, ?current_owner, "Lost claim race");
            report.conflicts += 1;
        }
        Err(e) => {
            ctx.record_store_error();
            warn!(worker_id, shard_id, error = %e, "Claim failed, skipping shard this tick");
            report.errors += 1;
        }
    }
}

/// Reconcile the registry against the stream's topology and keep lease
/// rows in step with it
async fn sync_shards(ctx: &LeaseContext, discovery: &dyn ShardDiscovery) -> Result<()> {
    let listed = tokio::time::timeout(ctx.config.store_call_timeout, discovery.list_shards())
        .await
        .map_err(|_| LeaseError::StoreTimeout {
            operation: "list_shards",
            shard_id: String::new(),
            timeout_ms: ctx.config.store_call_timeout.as_millis() as u64,
        })??;

    let delta = ctx.registry.reconcile(&listed);

    for descriptor in listed.iter().filter(|d| delta.added.contains(&d.shard_id)) {
        let created = bounded(ctx.config.store_call_timeout, "create", &descriptor.shard_id, async {
            ctx.store
                .create_if_absent(&descriptor.shard_id, &descriptor.parent_shard_ids)
                .await
        })
        .await;
        if let Err(e) = created {
            ctx.record_store_error();
            warn!(shard_id = %descriptor.shard_id, error = %e, "Creating lease row failed");
        }
    }

    for retired in &delta.removed {
        let shard_id = retired.id();
        let closed = match ctx.read_lease(shard_id).await {
            Ok(Some(record)) => record.checkpoint.as_deref() == Some(SHARD_END),
            Ok(None) => false,
            Err(_) => retired.is_closed(),
        };
        if !closed {
            debug!(worker_id = ctx.worker_id(), shard_id, "Shard left the listing before it was finished");
            continue;
        }

        debug!(worker_id = ctx.worker_id(), shard_id, "Shard retired, deleting lease row");
        let deleted = bounded(ctx.config.store_call_timeout, "delete", shard_id, async {
            ctx.store.delete(shard_id).await
        })
        .await;
        if let Err(e) = deleted {
            ctx.record_store_error();
            warn!(shard_id, error = %e, "Deleting retired lease row failed");
        }
    }
    Ok(())
}

/// Wake the rebalancer when the set of live lease holders changed
fn observe_membership(ctx: &LeaseContext) {
    let now = Utc::now();
    let snapshots: Vec<_> = ctx
        .registry
        .shard_ids()
        .iter()
        .filter_map(|id| ctx.registry.get(id))
        .map(|status| status.snapshot())
        .collect();

    let workers = active_workers(&snapshots, now, ctx.worker_id());
    if ctx.membership.observe(workers) {
        ctx.rebalance_trigger.notify_one();
    }
}
