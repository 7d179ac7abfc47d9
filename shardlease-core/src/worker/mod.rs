//! Worker-side logic
//!
//! Worker lifecycle, owned-shard bookkeeping and the processing pipeline
//! boundary.

pub mod processor;
pub mod runner;
pub mod state;

pub use processor::{RecordingProcessor, ShardEvent, ShardProcessor};
pub use runner::Worker;
pub use state::{OwnedShards, WorkerPhase};
