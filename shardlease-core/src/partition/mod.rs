//! Shard data model
//!
//! Local lease view per shard, the registry holding it, and the sticky policy.

pub mod registry;
pub mod status;
pub mod sticky;

pub use registry::{ShardRegistry, SyncDelta};
pub use status::{ShardSnapshot, ShardStatus, SHARD_END};
pub use sticky::StickyPolicy;
