//! Local view of a shard's lease
//!
//! A `ShardStatus` caches what this worker last observed in the lease
//! store. The store stays authoritative; every ownership change is
//! re-validated through a conditional write.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::sticky::StickyPolicy;
use crate::store::LeaseRecord;

/// Checkpoint value marking a shard as fully processed
pub const SHARD_END: &str = "SHARD_END";

#[derive(Debug, Clone, Default)]
struct LeaseFields {
    lease_owner: Option<String>,
    lease_timeout: Option<DateTime<Utc>>,
    checkpoint: Option<String>,
    sticky: i64,
}

/// Status of a single shard, shared between the assignment loop, the
/// rebalancer and the shard's renewal task
#[derive(Debug)]
pub struct ShardStatus {
    id: String,
    parent_shard_ids: Vec<String>,
    fields: RwLock<LeaseFields>,
}

/// Consistent copy of a shard's lease fields, taken under one lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshot {
    pub id: String,
    pub lease_owner: Option<String>,
    pub lease_timeout: Option<DateTime<Utc>>,
    pub checkpoint: Option<String>,
    pub sticky: i64,
}

impl ShardStatus {
    /// Create an unassigned shard
    pub fn new(id: impl Into<String>, parent_shard_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            parent_shard_ids,
            fields: RwLock::new(LeaseFields::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_shard_ids(&self) -> &[String] {
        &self.parent_shard_ids
    }

    /// Current owner, `None` when unassigned
    pub fn lease_owner(&self) -> Option<String> {
        self.fields.read().lease_owner.clone()
    }

    pub fn lease_timeout(&self) -> Option<DateTime<Utc>> {
        self.fields.read().lease_timeout
    }

    /// Record a lease held by `owner` until `timeout`
    pub fn set_lease(&self, owner: impl Into<String>, timeout: DateTime<Utc>) {
        let mut fields = self.fields.write();
        fields.lease_owner = Some(owner.into());
        fields.lease_timeout = Some(timeout);
    }

    /// Extend the timeout of the lease already recorded
    pub fn set_lease_timeout(&self, timeout: DateTime<Utc>) {
        self.fields.write().lease_timeout = Some(timeout);
    }

    pub fn clear_lease_owner(&self) {
        let mut fields = self.fields.write();
        fields.lease_owner = None;
        fields.lease_timeout = None;
    }

    pub fn checkpoint(&self) -> Option<String> {
        self.fields.read().checkpoint.clone()
    }

    pub fn set_checkpoint(&self, checkpoint: Option<String>) {
        self.fields.write().checkpoint = checkpoint;
    }

    /// Raw sticky attribute, 0 until observed otherwise
    pub fn sticky(&self) -> i64 {
        self.fields.read().sticky
    }

    pub fn set_sticky(&self, sticky: i64) {
        self.fields.write().sticky = sticky;
    }

    /// Sticky policy as of the last observation
    pub fn policy(&self) -> StickyPolicy {
        StickyPolicy::classify(Some(self.sticky()))
    }

    /// Whether processing reached the end of the shard
    pub fn is_closed(&self) -> bool {
        self.fields.read().checkpoint.as_deref() == Some(SHARD_END)
    }

    /// Replace the cached fields with a freshly read lease row.
    ///
    /// A missing row means nobody owns the shard and no sticky attribute is set.
    pub fn apply_record(&self, record: Option<&LeaseRecord>) {
        let mut fields = self.fields.write();
        match record {
            Some(record) => {
                fields.lease_owner = record.lease_owner.clone();
                fields.lease_timeout = record.lease_timeout;
                fields.checkpoint = record.checkpoint.clone();
                fields.sticky = record.sticky.unwrap_or_default();
            }
            None => {
                fields.lease_owner = None;
                fields.lease_timeout = None;
                fields.sticky = 0;
            }
        }
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        let fields = self.fields.read();
        ShardSnapshot {
            id: self.id.clone(),
            lease_owner: fields.lease_owner.clone(),
            lease_timeout: fields.lease_timeout,
            checkpoint: fields.checkpoint.clone(),
            sticky: fields.sticky,
        }
    }
}

impl ShardSnapshot {
    pub fn policy(&self) -> StickyPolicy {
        StickyPolicy::classify(Some(self.sticky))
    }

    pub fn is_closed(&self) -> bool {
        self.checkpoint.as_deref() == Some(SHARD_END)
    }

    /// An owned lease whose timeout has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_timeout.map_or(true, |t| t <= now)
    }

    /// Owner holding a lease that has not expired yet
    pub fn active_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            return None;
        }
        self.lease_owner.as_deref()
    }
}
