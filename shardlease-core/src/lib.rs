//! Shardlease Core - leaderless shard lease coordination
//!
//! Workers share a lease table with conditional updates and use it to:
//! - Claim unowned and expired shard leases
//! - Renew owned leases and hand them back on request
//! - Rebalance ownership by stealing from overloaded workers
//! - Honour per-shard sticky pins and release requests
//!
//! There is no coordinator process. The lease table's compare-and-swap is
//! the only serialization point between workers.

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod runtime;
pub mod store;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{LeaseError, Result};
pub use partition::{ShardRegistry, ShardStatus, StickyPolicy};
pub use store::{InMemoryLeaseStore, LeaseStore};
pub use worker::{ShardProcessor, Worker};

/// Sticky value pinning a shard to its current owner
pub const STICKY_PINNED: i64 = partition::sticky::STICKY_PINNED;

/// Sticky value asking the owner to hand the shard back
pub const STICKY_RELEASE_REQUESTED: i64 = partition::sticky::STICKY_RELEASE_REQUESTED;
