//! Processing pipeline boundary
//!
//! The engine never reads records itself. It tells the pipeline when a
//! shard is owned, lost, or must be handed back, and persists whatever
//! checkpoint the pipeline returns on hand-back.

use async_trait::async_trait;
use parking_lot::Mutex;

/// Ownership signals delivered to the record-processing pipeline
#[async_trait]
pub trait ShardProcessor: Send + Sync {
    /// This worker now owns the shard; resume after `checkpoint`
    async fn on_acquired(&self, shard_id: &str, checkpoint: Option<&str>);

    /// Ownership is gone. Stop immediately; do not checkpoint.
    async fn on_lost(&self, shard_id: &str);

    /// Finish the in-flight batch, start no new one, and return the
    /// checkpoint to persist. May be called again for the same shard if the
    /// hand-back had to be retried.
    async fn on_release_requested(&self, shard_id: &str) -> Option<String>;

    /// Worker is shutting down; same contract as `on_release_requested`
    async fn on_shutdown(&self, shard_id: &str) -> Option<String> {
        self.on_release_requested(shard_id).await
    }
}

/// Signal observed by a `RecordingProcessor`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    Acquired { shard_id: String, checkpoint: Option<String> },
    Lost { shard_id: String },
    ReleaseRequested { shard_id: String },
    Shutdown { shard_id: String },
}

impl ShardEvent {
    pub fn shard_id(&self) -> &str {
        match self {
            ShardEvent::Acquired { shard_id, .. }
            | ShardEvent::Lost { shard_id }
            | ShardEvent::ReleaseRequested { shard_id }
            | ShardEvent::Shutdown { shard_id } => shard_id,
        }
    }
}

/// Processor that records every signal and hands back a fixed checkpoint
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    events: Mutex<Vec<ShardEvent>>,
    checkpoint: Mutex<Option<String>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint returned on release and shutdown
    pub fn with_checkpoint(checkpoint: impl Into<String>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            checkpoint: Mutex::new(Some(checkpoint.into())),
        }
    }

    pub fn events(&self) -> Vec<ShardEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, shard_id: &str) -> Vec<ShardEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.shard_id() == shard_id)
            .cloned()
            .collect()
    }

    fn push(&self, event: ShardEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl ShardProcessor for RecordingProcessor {
    async fn on_acquired(&self, shard_id: &str, checkpoint: Option<&str>) {
        self.push(ShardEvent::Acquired {
            shard_id: shard_id.to_string(),
            checkpoint: checkpoint.map(str::to_string),
        });
    }

    async fn on_lost(&self, shard_id: &str) {
        self.push(ShardEvent::Lost {
            shard_id: shard_id.to_string(),
        });
    }

    async fn on_release_requested(&self, shard_id: &str) -> Option<String> {
        self.push(ShardEvent::ReleaseRequested {
            shard_id: shard_id.to_string(),
        });
        self.checkpoint.lock().clone()
    }

    async fn on_shutdown(&self, shard_id: &str) -> Option<String> {
        self.push(ShardEvent::Shutdown {
            shard_id: shard_id.to_string(),
        });
        self.checkpoint.lock().clone()
    }
}
