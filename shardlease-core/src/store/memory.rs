//! In-memory lease table
//!
//! Exact compare-and-swap semantics behind a single mutex. Backs the demo
//! binary and the test suites, and doubles as the reference for what a
//! real backend's conditional expressions must enforce.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{ClaimCondition, ClaimOutcome, LeaseRecord, LeaseStore, LeaseSummary};
use crate::error::{LeaseError, Result};

/// Lease table held in process memory
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    rows: Mutex<BTreeMap<String, LeaseRecord>>,
    /// Fail every call while set
    unavailable: AtomicBool,
    /// Artificial per-call latency in milliseconds
    latency_ms: AtomicU64,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with unowned rows
    pub fn with_shards<I, S>(shard_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut rows = store.rows.lock();
            for id in shard_ids {
                let id = id.into();
                rows.insert(id.clone(), LeaseRecord::new(id));
            }
        }
        store
    }

    /// Overwrite a row unconditionally (operator tooling, tests)
    pub fn put_record(&self, record: LeaseRecord) {
        self.rows.lock().insert(record.shard_id.clone(), record);
    }

    /// Set the sticky attribute of a row (operator tooling)
    pub fn set_sticky(&self, shard_id: &str, sticky: i64) {
        if let Some(row) = self.rows.lock().get_mut(shard_id) {
            row.sticky = Some(sticky);
        }
    }

    /// Remove the sticky attribute from a row
    pub fn clear_sticky(&self, shard_id: &str) {
        if let Some(row) = self.rows.lock().get_mut(shard_id) {
            row.sticky = None;
        }
    }

    /// Synchronous read, for assertions
    pub fn record(&self, shard_id: &str) -> Option<LeaseRecord> {
        self.rows.lock().get(shard_id).cloned()
    }

    /// Owner of every row that has one
    pub fn owners(&self) -> BTreeMap<String, String> {
        self.rows
            .lock()
            .values()
            .filter_map(|r| r.lease_owner.clone().map(|o| (r.shard_id.clone(), o)))
            .collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::StoreUnavailable {
                message: format!("{} rejected: store offline", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, shard_id: &str) -> Result<Option<LeaseRecord>> {
        self.enter("get").await?;
        Ok(self.rows.lock().get(shard_id).cloned())
    }

    async fn create_if_absent(&self, shard_id: &str, parent_shard_ids: &[String]) -> Result<bool> {
        self.enter("create").await?;
        let mut rows = self.rows.lock();
        if rows.contains_key(shard_id) {
            return Ok(false);
        }
        rows.insert(
            shard_id.to_string(),
            LeaseRecord::new(shard_id).with_parents(parent_shard_ids.to_vec()),
        );
        Ok(true)
    }

    async fn conditional_claim(
        &self,
        shard_id: &str,
        new_owner: &str,
        new_expiry: DateTime<Utc>,
        condition: &ClaimCondition,
    ) -> Result<ClaimOutcome> {
        self.enter("claim").await?;
        let mut rows = self.rows.lock();
        let current = rows.get(shard_id);

        if !condition.holds(current, new_owner, Utc::now()) {
            let current_owner = current.and_then(|r| r.lease_owner.clone());
            debug!(
                shard_id,
                new_owner,
                condition = condition.as_str(),
                ?current_owner,
                "Conditional claim rejected"
            );
            return Ok(ClaimOutcome::Conflict { current_owner });
        }

        let row = rows
            .entry(shard_id.to_string())
            .or_insert_with(|| LeaseRecord::new(shard_id));
        row.lease_owner = Some(new_owner.to_string());
        row.lease_timeout = Some(new_expiry);
        Ok(ClaimOutcome::Claimed)
    }

    async fn conditional_renew(
        &self,
        shard_id: &str,
        new_expiry: DateTime<Utc>,
        expected_owner: &str,
    ) -> Result<bool> {
        self.enter("renew").await?;
        let mut rows = self.rows.lock();
        match rows.get_mut(shard_id) {
            Some(row) if row.lease_owner.as_deref() == Some(expected_owner) => {
                row.lease_timeout = Some(new_expiry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn conditional_remove_owner(&self, shard_id: &str, expected_owner: &str) -> Result<bool> {
        self.enter("remove_owner").await?;
        let mut rows = self.rows.lock();
        match rows.get_mut(shard_id) {
            Some(row) if row.lease_owner.as_deref() == Some(expected_owner) => {
                row.lease_owner = None;
                row.lease_timeout = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn checkpoint(&self, shard_id: &str, checkpoint: &str, expected_owner: &str) -> Result<bool> {
        self.enter("checkpoint").await?;
        let mut rows = self.rows.lock();
        match rows.get_mut(shard_id) {
            Some(row) if row.lease_owner.as_deref() == Some(expected_owner) => {
                row.checkpoint = Some(checkpoint.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, shard_id: &str) -> Result<()> {
        self.enter("delete").await?;
        self.rows.lock().remove(shard_id);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<LeaseSummary>> {
        self.enter("scan").await?;
        Ok(self.rows.lock().values().map(LeaseSummary::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn expiry(secs: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_claim_unowned_then_conflict() {
        let store = InMemoryLeaseStore::with_shards(["shard-0001"]);

        let first = store
            .conditional_claim("shard-0001", "worker-a", expiry(10), &ClaimCondition::Unowned)
            .await
            .unwrap();
        assert!(first.is_claimed());

        let second = store
            .conditional_claim("shard-0001", "worker-b", expiry(10), &ClaimCondition::Unowned)
            .await
            .unwrap();
        assert_eq!(
            second,
            ClaimOutcome::Conflict { current_owner: Some("worker-a".into()) }
        );
    }

    #[tokio::test]
    async fn test_claim_creates_missing_row() {
        let store = InMemoryLeaseStore::new();
        let outcome = store
            .conditional_claim("shard-0042", "worker-a", expiry(10), &ClaimCondition::Unowned)
            .await
            .unwrap();
        assert!(outcome.is_claimed());
        assert_eq!(store.record("shard-0042").unwrap().lease_owner.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_expired_claim_requires_expiry() {
        let store = InMemoryLeaseStore::new();
        store.put_record(LeaseRecord::new("shard-0001").with_owner("worker-a", expiry(10)));

        let cond = ClaimCondition::Expired { owner: "worker-a".into() };
        let live = store.conditional_claim("shard-0001", "worker-b", expiry(10), &cond).await.unwrap();
        assert!(!live.is_claimed());

        store.put_record(LeaseRecord::new("shard-0001").with_owner("worker-a", expiry(-1)));
        let stale = store.conditional_claim("shard-0001", "worker-b", expiry(10), &cond).await.unwrap();
        assert!(stale.is_claimed());
    }

    #[tokio::test]
    async fn test_renew_and_remove_owner_check_owner() {
        let store = InMemoryLeaseStore::new();
        store.put_record(LeaseRecord::new("shard-0001").with_owner("worker-a", expiry(10)));

        assert!(!store.conditional_renew("shard-0001", expiry(20), "worker-b").await.unwrap());
        assert!(store.conditional_renew("shard-0001", expiry(20), "worker-a").await.unwrap());

        assert!(!store.conditional_remove_owner("shard-0001", "worker-b").await.unwrap());
        assert!(store.conditional_remove_owner("shard-0001", "worker-a").await.unwrap());
        assert_eq!(store.record("shard-0001").unwrap().lease_owner, None);
        assert!(!store.conditional_renew("shard-0001", expiry(20), "worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_requires_ownership() {
        let store = InMemoryLeaseStore::new();
        store.put_record(LeaseRecord::new("shard-0001").with_owner("worker-a", expiry(10)));

        assert!(!store.checkpoint("shard-0001", "seq-9", "worker-b").await.unwrap());
        assert!(store.checkpoint("shard-0001", "seq-9", "worker-a").await.unwrap());
        assert_eq!(store.record("shard-0001").unwrap().checkpoint.as_deref(), Some("seq-9"));
    }

    #[tokio::test]
    async fn test_sticky_is_preserved_by_claims() {
        let store = InMemoryLeaseStore::with_shards(["shard-0001"]);
        store.set_sticky("shard-0001", 10);

        store
            .conditional_claim("shard-0001", "worker-a", expiry(10), &ClaimCondition::Unowned)
            .await
            .unwrap();
        assert_eq!(store.record("shard-0001").unwrap().sticky, Some(10));

        store.clear_sticky("shard-0001");
        assert_eq!(store.record("shard-0001").unwrap().sticky, None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryLeaseStore::with_shards(["shard-0001"]);
        store.set_unavailable(true);
        let err = store.get("shard-0001").await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert!(store.get("shard-0001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_racing_claims_single_winner() {
        let store = Arc::new(InMemoryLeaseStore::with_shards(["shard-0001"]));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .conditional_claim(
                            "shard-0001",
                            &format!("worker-{}", i),
                            expiry(10),
                            &ClaimCondition::Unowned,
                        )
                        .await
                        .unwrap()
                        .is_claimed()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let store = InMemoryLeaseStore::with_shards(["shard-0001", "shard-0002"]);
        store.set_sticky("shard-0002", 20);

        let rows = store.scan().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sticky, Some(20));

        store.delete("shard-0001").await.unwrap();
        assert_eq!(store.scan().await.unwrap().len(), 1);
        assert!(!store.create_if_absent("shard-0002", &[]).await.unwrap());
        assert!(store.create_if_absent("shard-0001", &[]).await.unwrap());
    }
}
