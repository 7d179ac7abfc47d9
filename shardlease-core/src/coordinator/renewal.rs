//! Lease renewal loop
//!
//! One task per owned shard. Each cycle re-reads the lease row, hands the
//! shard back when a release was requested, and otherwise extends the
//! lease. A failed renewal condition means the lease was taken over.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::LeaseContext;
use crate::metrics::standard;
use crate::partition::{ShardStatus, StickyPolicy};

/// Why a renewal task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExit {
    /// Another worker owns the lease now, or this worker's lease ran out
    Lost,
    /// Lease handed back after a release request
    Released,
    /// Shard left the registry
    Retired,
    /// Worker shutdown; lease handed back
    Shutdown,
}

/// Result of a single renewal cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalStep {
    /// Still the owner (or the store could not be reached); keep going
    Continue,
    Exit(RenewalExit),
}

/// Spawn the renewal task for a shard this worker just acquired
pub fn spawn_renewal_loop(
    ctx: Arc<LeaseContext>,
    shard_id: String,
    generation: u64,
) -> JoinHandle<RenewalExit> {
    tokio::spawn(async move {
        let exit = run_renewal_loop(&ctx, &shard_id).await;
        ctx.owned.finish(&shard_id, generation);
        debug!(worker_id = ctx.worker_id(), shard_id = %shard_id, ?exit, "Renewal loop finished");
        exit
    })
}

async fn run_renewal_loop(ctx: &Arc<LeaseContext>, shard_id: &str) -> RenewalExit {
    let mut shutdown = ctx.shutdown.subscribe();
    let period = ctx.config.lease_refresh_period;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                hand_back_on_shutdown(ctx, shard_id).await;
                return RenewalExit::Shutdown;
            }
            _ = tokio::time::sleep(period) => {}
        }

        if let RenewalStep::Exit(exit) = renew_once(ctx, shard_id).await {
            return exit;
        }
    }
}

/// One renewal cycle for `shard_id`
pub async fn renew_once(ctx: &LeaseContext, shard_id: &str) -> RenewalStep {
    let worker_id = ctx.worker_id();

    let Some(status) = ctx.registry.get(shard_id) else {
        debug!(worker_id, shard_id, "Shard left the registry, stopping renewal");
        ctx.processor.on_lost(shard_id).await;
        return RenewalStep::Exit(RenewalExit::Retired);
    };

    let record = match ctx.read_lease(shard_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            info!(worker_id, shard_id, "Lease row deleted, stopping processing");
            return lose(ctx, &status).await;
        }
        Err(e) => {
            ctx.record_store_error();
            return keep_or_expire(ctx, &status, &e.to_string()).await;
        }
    };
    status.apply_record(Some(&record));

    if StickyPolicy::classify(record.sticky) == StickyPolicy::ReleaseRequested {
        return release(ctx, &status).await;
    }

    if record.lease_owner.as_deref() != Some(worker_id) {
        info!(
            worker_id,
            shard_id,
            new_owner = ?record.lease_owner,
            "Lease taken over, stopping processing"
        );
        return lose(ctx, &status).await;
    }

    match ctx.renew(shard_id).await {
        Ok(Some(expiry)) => {
            status.set_lease_timeout(expiry);
            standard::LEASES_RENEWED.inc();
            RenewalStep::Continue
        }
        Ok(None) => {
            info!(worker_id, shard_id, "Lease renewal lost the race, stopping processing");
            lose(ctx, &status).await
        }
        Err(e) => {
            ctx.record_store_error();
            keep_or_expire(ctx, &status, &e.to_string()).await
        }
    }
}

/// Ownership is gone: stop the pipeline without checkpointing
async fn lose(ctx: &LeaseContext, status: &ShardStatus) -> RenewalStep {
    standard::LEASES_LOST.inc();
    if status.lease_owner().as_deref() == Some(ctx.worker_id()) {
        status.clear_lease_owner();
    }
    ctx.processor.on_lost(status.id()).await;
    RenewalStep::Exit(RenewalExit::Lost)
}

/// Transient store failure: keep processing on the last good lease until
/// it runs out locally
async fn keep_or_expire(ctx: &LeaseContext, status: &ShardStatus, error: &str) -> RenewalStep {
    let expired = status.lease_timeout().map_or(true, |t| t <= Utc::now());
    if !expired {
        warn!(
            worker_id = ctx.worker_id(),
            shard_id = status.id(),
            error,
            "Lease renewal failed, retrying next cycle"
        );
        return RenewalStep::Continue;
    }

    warn!(
        worker_id = ctx.worker_id(),
        shard_id = status.id(),
        error,
        "Lease expired without a successful renewal, stopping processing"
    );
    lose(ctx, status).await
}

/// Hand the shard back after a release request.
///
/// Any store failure leaves the task running so the hand-back is retried
/// on the next cycle.
async fn release(ctx: &LeaseContext, status: &ShardStatus) -> RenewalStep {
    let worker_id = ctx.worker_id();
    let shard_id = status.id();
    info!(worker_id, shard_id, "Release requested, handing shard back");

    let checkpoint = ctx.processor.on_release_requested(shard_id).await;
    if let Some(checkpoint) = checkpoint.as_deref() {
        match ctx.persist_checkpoint(shard_id, checkpoint).await {
            Ok(true) => status.set_checkpoint(Some(checkpoint.to_string())),
            Ok(false) => {
                debug!(worker_id, shard_id, "Lease moved before the release checkpoint");
                return lose(ctx, status).await;
            }
            Err(e) => {
                ctx.record_store_error();
                warn!(worker_id, shard_id, error = %e, "Release checkpoint failed, retrying");
                return RenewalStep::Continue;
            }
        }
    }

    match ctx.remove_owner(shard_id).await {
        Ok(false) => {
            debug!(worker_id, shard_id, "Lease moved before hand-back");
            lose(ctx, status).await
        }
        Ok(true) => {
            status.clear_lease_owner();
            standard::LEASES_RELEASED.inc();
            info!(worker_id, shard_id, "Shard lease released");
            RenewalStep::Exit(RenewalExit::Released)
        }
        Err(e) => {
            ctx.record_store_error();
            warn!(worker_id, shard_id, error = %e, "Removing lease owner failed, retrying");
            RenewalStep::Continue
        }
    }
}

/// Graceful shutdown path: checkpoint and clear the owner, best effort
async fn hand_back_on_shutdown(ctx: &LeaseContext, shard_id: &str) {
    let worker_id = ctx.worker_id();
    let checkpoint = ctx.processor.on_shutdown(shard_id).await;

    if let Some(checkpoint) = checkpoint.as_deref() {
        if let Err(e) = ctx.persist_checkpoint(shard_id, checkpoint).await {
            warn!(worker_id, shard_id, error = %e, "Shutdown checkpoint failed");
        }
    }
    match ctx.remove_owner(shard_id).await {
        Ok(_) => {
            if let Some(status) = ctx.registry.get(shard_id) {
                status.clear_lease_owner();
            }
            debug!(worker_id, shard_id, "Lease handed back on shutdown");
        }
        // Lease simply expires
        Err(e) => warn!(worker_id, shard_id, error = %e, "Lease hand-back on shutdown failed"),
    }
}
