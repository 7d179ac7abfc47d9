//! Lease store contract
//!
//! The lease table is the only coordination medium between workers. Every
//! ownership change goes through a compare-and-swap style call that reports
//! success or failure; a failed condition means another actor got there
//! first.

pub mod memory;

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LeaseError, Result};
use crate::metrics::standard;

pub use memory::InMemoryLeaseStore;

/// One row of the lease table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub shard_id: String,
    #[serde(default)]
    pub parent_shard_ids: Vec<String>,
    pub lease_owner: Option<String>,
    pub lease_timeout: Option<DateTime<Utc>>,
    pub checkpoint: Option<String>,
    /// Externally managed; never written by the engine
    pub sticky: Option<i64>,
}

impl LeaseRecord {
    /// Unowned row with no checkpoint
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids: Vec::new(),
            lease_owner: None,
            lease_timeout: None,
            checkpoint: None,
            sticky: None,
        }
    }

    pub fn with_parents(mut self, parent_shard_ids: Vec<String>) -> Self {
        self.parent_shard_ids = parent_shard_ids;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>, lease_timeout: DateTime<Utc>) -> Self {
        self.lease_owner = Some(owner.into());
        self.lease_timeout = Some(lease_timeout);
        self
    }

    pub fn with_sticky(mut self, sticky: i64) -> Self {
        self.sticky = Some(sticky);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    /// An owned lease whose timeout has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_timeout.map_or(true, |t| t <= now)
    }
}

/// Monitoring view of a lease row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSummary {
    pub shard_id: String,
    pub lease_owner: Option<String>,
    pub sticky: Option<i64>,
}

impl From<&LeaseRecord> for LeaseSummary {
    fn from(record: &LeaseRecord) -> Self {
        Self {
            shard_id: record.shard_id.clone(),
            lease_owner: record.lease_owner.clone(),
            sticky: record.sticky,
        }
    }
}

/// Condition a claim must satisfy at write time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCondition {
    /// No row, or a row with no owner
    Unowned,
    /// Still owned by `owner`, and that lease has expired
    Expired { owner: String },
    /// Already owned by the claimant
    Renewal,
    /// Still owned by `owner`, whatever the lease state (rebalancing)
    Steal { owner: String },
}

impl ClaimCondition {
    /// Evaluate against the row as it is at write time
    pub fn holds(&self, record: Option<&LeaseRecord>, claimant: &str, now: DateTime<Utc>) -> bool {
        let owner = record.and_then(|r| r.lease_owner.as_deref());
        match self {
            ClaimCondition::Unowned => owner.is_none(),
            ClaimCondition::Expired { owner: expected } => {
                owner == Some(expected.as_str()) && record.map_or(false, |r| r.is_expired(now))
            }
            ClaimCondition::Renewal => owner == Some(claimant),
            ClaimCondition::Steal { owner: expected } => owner == Some(expected.as_str()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimCondition::Unowned => "unowned",
            ClaimCondition::Expired { .. } => "expired",
            ClaimCondition::Renewal => "renewal",
            ClaimCondition::Steal { .. } => "steal",
        }
    }
}

/// Result of a conditional claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Condition failed; carries the owner recorded at write time
    Conflict { current_owner: Option<String> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Conditionally-updatable lease table
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease row for a shard
    async fn get(&self, shard_id: &str) -> Result<Option<LeaseRecord>>;

    /// Create an unowned row if none exists; returns whether it was created
    async fn create_if_absent(&self, shard_id: &str, parent_shard_ids: &[String]) -> Result<bool>;

    /// Set owner and expiry if `condition` holds
    async fn conditional_claim(
        &self,
        shard_id: &str,
        new_owner: &str,
        new_expiry: DateTime<Utc>,
        condition: &ClaimCondition,
    ) -> Result<ClaimOutcome>;

    /// Extend the lease if `expected_owner` still holds it
    async fn conditional_renew(
        &self,
        shard_id: &str,
        new_expiry: DateTime<Utc>,
        expected_owner: &str,
    ) -> Result<bool>;

    /// Clear the owner if `expected_owner` still holds the lease
    async fn conditional_remove_owner(&self, shard_id: &str, expected_owner: &str) -> Result<bool>;

    /// Persist a checkpoint if `expected_owner` still holds the lease
    async fn checkpoint(&self, shard_id: &str, checkpoint: &str, expected_owner: &str) -> Result<bool>;

    /// Drop the row of a retired shard
    async fn delete(&self, shard_id: &str) -> Result<()>;

    /// All rows, for monitoring
    async fn scan(&self) -> Result<Vec<LeaseSummary>>;
}

/// Run a store call under `timeout`, recording its latency
pub async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    shard_id: &str,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, call).await;
    standard::STORE_CALL_DURATION.observe(start.elapsed().as_secs_f64());

    match result {
        Ok(inner) => inner,
        Err(_) => Err(LeaseError::StoreTimeout {
            operation,
            shard_id: shard_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
