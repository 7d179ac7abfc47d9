//! Lease rebalancing
//!
//! Moves shards from the most loaded worker to this one when the gap is
//! large enough. Only Normal shards take part: Pinned and ReleaseRequested
//! shards are neither counted as load nor offered up. Every steal goes
//! through the same conditional claim as acquisition, so a shard that moved
//! since the snapshot fails closed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::LeaseContext;
use super::membership::active_workers;
use crate::config::WorkerConfig;
use crate::metrics::standard;
use crate::partition::{ShardRegistry, ShardSnapshot, StickyPolicy, SHARD_END};
use crate::store::{ClaimCondition, ClaimOutcome};

/// Consistent view of the registry for one pass
#[derive(Debug, Default, Clone)]
pub struct RegistrySnapshot {
    /// Normal, unfinished shards
    pub eligible: Vec<ShardSnapshot>,
    /// Pinned or release-requested shards
    pub ineligible: usize,
    /// Finished shards
    pub closed: usize,
    /// Entries removed while the snapshot was taken
    pub vanished: usize,
    /// Worker set: holders of any live lease plus this worker
    pub workers: BTreeSet<String>,
}

impl RegistrySnapshot {
    /// Snapshot every shard currently in the registry
    pub fn take(registry: &ShardRegistry, now: DateTime<Utc>, local_worker: &str) -> Self {
        Self::take_ids(registry, &registry.shard_ids(), now, local_worker)
    }

    /// Snapshot the given IDs; IDs no longer registered are skipped
    pub fn take_ids(
        registry: &ShardRegistry,
        shard_ids: &[String],
        now: DateTime<Utc>,
        local_worker: &str,
    ) -> Self {
        let mut snapshot = Self::default();
        let mut all = Vec::with_capacity(shard_ids.len());

        for shard_id in shard_ids {
            let Some(status) = registry.get(shard_id) else {
                debug!(shard_id = %shard_id, "Shard left the registry during rebalance scan");
                snapshot.vanished += 1;
                continue;
            };
            let shard = status.snapshot();
            if shard.is_closed() {
                snapshot.closed += 1;
            } else if shard.policy().is_stealable() {
                snapshot.eligible.push(shard.clone());
            } else {
                snapshot.ineligible += 1;
            }
            all.push(shard);
        }

        snapshot.workers = active_workers(&all, now, local_worker);
        snapshot
    }

    /// Eligible shard IDs per live owner, each list in ascending order.
    ///
    /// Unowned and expired shards count toward the total but belong to
    /// nobody.
    pub fn loads(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<String>> {
        let mut loads: BTreeMap<String, Vec<String>> = self
            .workers
            .iter()
            .map(|w| (w.clone(), Vec::new()))
            .collect();
        for shard in &self.eligible {
            if let Some(owner) = shard.active_owner(now) {
                loads.entry(owner.to_string()).or_default().push(shard.id.clone());
            }
        }
        for ids in loads.values_mut() {
            ids.sort();
        }
        loads
    }
}

/// Shards to take from one victim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealPlan {
    pub victim: String,
    pub shards: Vec<String>,
}

/// Target-count balancing with an anti-oscillation threshold.
///
/// With `E` eligible shards and `W` workers each worker should end up with
/// `floor(E / W)` or `ceil(E / W)` shards. This worker steals while it is
/// below the ceiling, the most loaded worker is above the floor, and their
/// counts differ by at least `steal_threshold` (never less than 2, since a
/// gap of one cannot be narrowed). A pass never takes so many that the
/// victim ends up with fewer shards than this worker, so the victim has no
/// reason to steal back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancePolicy {
    pub max_steals_per_pass: usize,
    pub steal_threshold: usize,
}

impl BalancePolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_steals_per_pass: config.max_steals_per_pass,
            steal_threshold: config.steal_threshold,
        }
    }

    /// Per-worker target for `eligible` shards over `workers` workers (floor)
    pub fn target(eligible: usize, workers: usize) -> usize {
        if workers == 0 {
            return 0;
        }
        eligible / workers
    }

    /// Largest count a worker may hold in a balanced fleet
    pub fn ceiling(eligible: usize, workers: usize) -> usize {
        if workers == 0 {
            return 0;
        }
        eligible.div_ceil(workers)
    }

    /// Decide what `local` should steal, if anything
    pub fn plan(
        &self,
        local: &str,
        loads: &BTreeMap<String, Vec<String>>,
        eligible: usize,
    ) -> Option<StealPlan> {
        let workers = loads.len().max(1);
        let target = Self::target(eligible, workers);
        let ceiling = Self::ceiling(eligible, workers);
        let mine = loads.get(local).map_or(0, Vec::len);
        if mine >= ceiling {
            return None;
        }

        // Most loaded worker; BTreeMap order breaks ties toward the smallest ID
        let (victim, victim_shards) = loads
            .iter()
            .filter(|(worker, _)| worker.as_str() != local)
            .fold(None, |best: Option<(&String, &Vec<String>)>, (worker, shards)| match best {
                Some((_, best_shards)) if best_shards.len() >= shards.len() => best,
                _ => Some((worker, shards)),
            })?;

        let theirs = victim_shards.len();
        if theirs <= target || theirs <= mine || theirs - mine < self.steal_threshold.max(2) {
            return None;
        }

        let count = self
            .max_steals_per_pass
            .min(ceiling - mine)
            .min(theirs - target)
            .min((theirs - mine) / 2);
        if count == 0 {
            return None;
        }
        Some(StealPlan {
            victim: victim.clone(),
            shards: victim_shards.iter().take(count).cloned().collect(),
        })
    }
}

/// How a rebalance pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// Every known shard is pinned, release-requested, or finished
    NoEligibleShards,
    /// Nothing to steal
    Balanced,
    /// Already holding the maximum number of leases
    AtCapacity,
    /// At least one steal succeeded
    Stole { stolen: Vec<String>, failed: usize },
    /// Steals were attempted and every one failed
    StealFailed { failed: usize },
}

/// Summary of one rebalance pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub eligible: usize,
    pub ineligible: usize,
    pub closed: usize,
    pub vanished: usize,
    pub workers: usize,
    pub outcome: RebalanceOutcome,
}

/// Spawn the rebalance loop: runs every `rebalance_interval` and whenever
/// the assignment loop reports a membership change
pub fn spawn_rebalance_loop(ctx: Arc<LeaseContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.subscribe();
        let period = ctx.config.rebalance_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
                _ = ctx.rebalance_trigger.notified() => {
                    debug!(worker_id = ctx.worker_id(), "Rebalance triggered by membership change");
                }
            }

            let report = rebalance_once(&ctx).await;
            debug!(worker_id = ctx.worker_id(), ?report, "Rebalance pass finished");
        }
        debug!(worker_id = ctx.worker_id(), "Rebalance loop stopped");
    })
}

/// Run one rebalance pass
pub async fn rebalance_once(ctx: &Arc<LeaseContext>) -> RebalanceReport {
    let worker_id = ctx.worker_id();
    let now = Utc::now();
    let snapshot = RegistrySnapshot::take(&ctx.registry, now, worker_id);

    let mut report = RebalanceReport {
        eligible: snapshot.eligible.len(),
        ineligible: snapshot.ineligible,
        closed: snapshot.closed,
        vanished: snapshot.vanished,
        workers: snapshot.workers.len(),
        outcome: RebalanceOutcome::Balanced,
    };

    if snapshot.eligible.is_empty() {
        standard::REBALANCE_NO_ELIGIBLE.inc();
        info!(
            worker_id,
            ineligible = snapshot.ineligible,
            "No shards eligible for rebalancing"
        );
        report.outcome = RebalanceOutcome::NoEligibleShards;
        return report;
    }
    if ctx.at_capacity() {
        report.outcome = RebalanceOutcome::AtCapacity;
        return report;
    }

    let policy = BalancePolicy::from_config(&ctx.config);
    let loads = snapshot.loads(now);
    let Some(plan) = policy.plan(worker_id, &loads, snapshot.eligible.len()) else {
        return report;
    };

    info!(
        worker_id,
        victim = %plan.victim,
        shards = ?plan.shards,
        "Stealing shards to rebalance"
    );

    let mut stolen = Vec::new();
    let mut failed = 0;
    for shard_id in &plan.shards {
        if steal_one(ctx, shard_id, &plan.victim).await {
            standard::SHARDS_STOLEN.inc();
            stolen.push(shard_id.clone());
        } else {
            standard::STEALS_FAILED.inc();
            failed += 1;
        }
    }

    report.outcome = if stolen.is_empty() {
        RebalanceOutcome::StealFailed { failed }
    } else {
        RebalanceOutcome::Stole { stolen, failed }
    };
    report
}

/// Take `shard_id` from `victim`; false when anything moved since the snapshot
async fn steal_one(ctx: &Arc<LeaseContext>, shard_id: &str, victim: &str) -> bool {
    let worker_id = ctx.worker_id();

    let Some(status) = ctx.registry.get(shard_id) else {
        debug!(worker_id, shard_id, "Steal candidate left the registry");
        return false;
    };

    let record = match ctx.read_lease(shard_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(worker_id, shard_id, "Steal candidate has no lease row");
            return false;
        }
        Err(e) => {
            ctx.record_store_error();
            warn!(worker_id, shard_id, error = %e, "Reading steal candidate failed");
            return false;
        }
    };
    status.apply_record(Some(&record));

    // Sticky may have changed since the snapshot
    if StickyPolicy::classify(record.sticky) != StickyPolicy::Normal
        || record.checkpoint.as_deref() == Some(SHARD_END)
        || record.lease_owner.as_deref() != Some(victim)
    {
        debug!(worker_id, shard_id, "Steal candidate changed since snapshot");
        return false;
    }

    let condition = ClaimCondition::Steal {
        owner: victim.to_string(),
    };
    match ctx.claim(shard_id, &condition).await {
        Ok((ClaimOutcome::Claimed, expiry)) => {
            info!(worker_id, shard_id, previous_owner = victim, "Stole shard lease");
            ctx.take_ownership(&status, expiry, record.checkpoint.clone()).await;
            true
        }
        Ok((ClaimOutcome::Conflict { current_owner }, _)) => {
            standard::CLAIM_CONFLICTS.inc();
            debug!(worker_id, shard_id, ?current_owner, "Steal lost the race");
            false
        }
        Err(e) => {
            ctx.record_store_error();
            warn!(worker_id, shard_id, error = %e, "Steal failed");
            false
        }
    }
}
