//! Rebalancing across several workers sharing one lease table

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shardlease_core::coordinator::RebalanceOutcome;
use shardlease_core::discovery::StaticShardDiscovery;
use shardlease_core::store::LeaseRecord;
use shardlease_core::worker::{RecordingProcessor, ShardEvent};
use shardlease_core::{InMemoryLeaseStore, Worker, WorkerConfig};

fn config(id: &str) -> WorkerConfig {
    WorkerConfig {
        lease_duration: Duration::from_millis(600),
        lease_refresh_period: Duration::from_millis(40),
        shard_sync_interval: Duration::from_millis(20),
        rebalance_interval: Duration::from_secs(60),
        ..WorkerConfig::with_worker_id(id)
    }
}

fn worker(
    store: &Arc<InMemoryLeaseStore>,
    discovery: &Arc<StaticShardDiscovery>,
    id: &str,
) -> (Worker, Arc<RecordingProcessor>) {
    let processor = Arc::new(RecordingProcessor::new());
    let worker = Worker::new(config(id), store.clone(), processor.clone())
        .unwrap()
        .with_discovery(discovery.clone());
    (worker, processor)
}

fn counts(store: &InMemoryLeaseStore) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for owner in store.owners().into_values() {
        *counts.entry(owner).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn test_newcomers_converge_to_even_split() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", 6));

    let (a, _) = worker(&store, &discovery, "worker-a");
    assert_eq!(a.run_assignment_tick().await.claimed.len(), 6);

    let (b, _) = worker(&store, &discovery, "worker-b");
    let (c, _) = worker(&store, &discovery, "worker-c");
    for _ in 0..5 {
        for w in [&b, &c] {
            w.run_assignment_tick().await;
            w.run_rebalance().await;
        }
    }

    let counts = counts(&store);
    assert_eq!(counts.values().sum::<usize>(), 6);
    assert_eq!(counts.get("worker-a"), Some(&2));
    assert_eq!(counts.get("worker-b"), Some(&2));
    assert_eq!(counts.get("worker-c"), Some(&2));

    // Balanced now; another pass steals nothing
    b.run_assignment_tick().await;
    assert_eq!(b.run_rebalance().await.outcome, RebalanceOutcome::Balanced);

    for w in [&a, &b, &c] {
        w.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_surplus_of_two_is_evened_out() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let expiry = Utc::now() + chrono::Duration::seconds(30);
    for (i, owner) in ["worker-a", "worker-b", "worker-b", "worker-b", "worker-c"]
        .into_iter()
        .enumerate()
    {
        store.put_record(LeaseRecord::new(format!("shard-{:04}", i)).with_owner(owner, expiry));
    }
    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", 5));
    let (a, _) = worker(&store, &discovery, "worker-a");
    let (c, _) = worker(&store, &discovery, "worker-c");

    a.run_assignment_tick().await;
    assert_eq!(
        a.run_rebalance().await.outcome,
        RebalanceOutcome::Stole {
            stolen: vec!["shard-0001".into()],
            failed: 0
        }
    );
    for _ in 0..3 {
        for w in [&a, &c] {
            w.run_assignment_tick().await;
            assert_eq!(w.run_rebalance().await.outcome, RebalanceOutcome::Balanced);
        }
    }

    let counts = counts(&store);
    assert_eq!(counts.get("worker-a"), Some(&2));
    assert_eq!(counts.get("worker-b"), Some(&2));
    assert_eq!(counts.get("worker-c"), Some(&1));

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pinned_shards_are_never_stolen() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let expiry = Utc::now() + chrono::Duration::seconds(30);
    for i in 0..6 {
        let mut record = LeaseRecord::new(format!("shard-{:04}", i)).with_owner("worker-a", expiry);
        if i < 4 {
            record = record.with_sticky(10);
        }
        store.put_record(record);
    }
    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", 6));
    let (b, _) = worker(&store, &discovery, "worker-b");

    b.run_assignment_tick().await;
    let report = b.run_rebalance().await;
    assert_eq!(report.eligible, 2);
    assert_eq!(report.ineligible, 4);
    assert_eq!(
        report.outcome,
        RebalanceOutcome::Stole {
            stolen: vec!["shard-0004".into()],
            failed: 0
        }
    );

    b.run_assignment_tick().await;
    assert_eq!(b.run_rebalance().await.outcome, RebalanceOutcome::Balanced);
    for i in 0..4 {
        let id = format!("shard-{:04}", i);
        assert_eq!(store.record(&id).unwrap().lease_owner.as_deref(), Some("worker-a"));
    }
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_eligible_is_distinct_from_balanced() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let expiry = Utc::now() + chrono::Duration::seconds(30);
    for (i, sticky) in [10, 20, 10].into_iter().enumerate() {
        store.put_record(
            LeaseRecord::new(format!("shard-{:04}", i))
                .with_owner("worker-a", expiry)
                .with_sticky(sticky),
        );
    }
    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", 3));
    let (b, _) = worker(&store, &discovery, "worker-b");

    b.run_assignment_tick().await;
    let report = b.run_rebalance().await;
    assert_eq!(report.outcome, RebalanceOutcome::NoEligibleShards);
    assert_eq!(report.eligible, 0);
    assert_eq!(report.ineligible, 3);
    assert_eq!(counts(&store).get("worker-a"), Some(&3));
}

#[tokio::test]
async fn test_victim_stops_processing_stolen_shard() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", 4));

    let (a, a_events) = worker(&store, &discovery, "worker-a");
    a.run_assignment_tick().await;
    assert_eq!(a.owned_shards().len(), 4);

    let (b, _) = worker(&store, &discovery, "worker-b");
    b.run_assignment_tick().await;
    let report = b.run_rebalance().await;
    assert_eq!(
        report.outcome,
        RebalanceOutcome::Stole {
            stolen: vec!["shard-0000".into()],
            failed: 0
        }
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while a.owned_shards().contains(&"shard-0000".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("victim kept renewing a stolen shard");

    assert!(a_events
        .events_for("shard-0000")
        .contains(&ShardEvent::Lost { shard_id: "shard-0000".into() }));
    assert_eq!(b.owned_shards(), vec!["shard-0000"]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
