//! Worker configuration
//!
//! Plain struct with defaults, optionally overridden from `SHARDLEASE_*`
//! environment variables.

use std::time::Duration;

use crate::error::{LeaseError, Result};

/// Configuration for one worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier written into lease rows this worker owns
    pub worker_id: String,
    /// How long a claimed or renewed lease stays valid
    pub lease_duration: Duration,
    /// Renewal cadence; also how quickly sticky changes are noticed
    pub lease_refresh_period: Duration,
    /// Assignment loop period (shard sync runs at the start of each tick)
    pub shard_sync_interval: Duration,
    /// Rebalancer period
    pub rebalance_interval: Duration,
    /// Upper bound on any single lease store call
    pub store_call_timeout: Duration,
    /// Stop acquiring new leases beyond this many
    pub max_leases_for_worker: usize,
    /// Steals attempted per rebalance pass
    pub max_steals_per_pass: usize,
    /// Minimum owned-count gap between victim and thief before stealing
    pub steal_threshold: usize,
    /// Run the rebalancer at all
    pub enable_lease_stealing: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(10),
            lease_refresh_period: Duration::from_secs(5),
            shard_sync_interval: Duration::from_secs(1),
            rebalance_interval: Duration::from_secs(30),
            store_call_timeout: Duration::from_secs(3),
            max_leases_for_worker: usize::MAX,
            max_steals_per_pass: 1,
            steal_threshold: 2,
            enable_lease_stealing: true,
        }
    }
}

impl WorkerConfig {
    /// Defaults with a fixed worker ID
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Load overrides from the environment.
    ///
    /// Durations are in milliseconds. Unparseable values are rejected
    /// rather than ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("SHARDLEASE_WORKER_ID") {
            config.worker_id = id;
        }
        if let Some(v) = parse::<u64>(&lookup, "SHARDLEASE_LEASE_DURATION_MS")? {
            config.lease_duration = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "SHARDLEASE_LEASE_REFRESH_MS")? {
            config.lease_refresh_period = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "SHARDLEASE_SHARD_SYNC_MS")? {
            config.shard_sync_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "SHARDLEASE_REBALANCE_MS")? {
            config.rebalance_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "SHARDLEASE_STORE_TIMEOUT_MS")? {
            config.store_call_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "SHARDLEASE_MAX_LEASES")? {
            config.max_leases_for_worker = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "SHARDLEASE_MAX_STEALS_PER_PASS")? {
            config.max_steals_per_pass = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "SHARDLEASE_STEAL_THRESHOLD")? {
            config.steal_threshold = v;
        }
        if let Some(v) = parse::<bool>(&lookup, "SHARDLEASE_ENABLE_STEALING")? {
            config.enable_lease_stealing = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(invalid("worker_id must not be empty"));
        }
        for (name, value) in [
            ("lease_duration", self.lease_duration),
            ("lease_refresh_period", self.lease_refresh_period),
            ("shard_sync_interval", self.shard_sync_interval),
            ("rebalance_interval", self.rebalance_interval),
            ("store_call_timeout", self.store_call_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(&format!("{} must be non-zero", name)));
            }
        }
        if self.lease_refresh_period >= self.lease_duration {
            return Err(invalid("lease_refresh_period must be shorter than lease_duration"));
        }
        if self.max_leases_for_worker == 0 {
            return Err(invalid("max_leases_for_worker must be at least 1"));
        }
        Ok(())
    }

    /// Lease duration as a wall-clock offset
    pub fn lease_span(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }
}

fn invalid(reason: &str) -> LeaseError {
    LeaseError::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(&format!("{}={:?}: {}", key, raw, e))),
    }
}
