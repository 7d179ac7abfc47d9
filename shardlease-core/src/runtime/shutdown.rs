//! Graceful shutdown handling
//!
//! Watch-based shutdown flag: listeners created after the signal fired still
//! observe it, so a renewal task spawned during shutdown exits at once.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown signal shared by every loop of a worker
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

/// Receiving half handed to a single task
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown; idempotent
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    /// Resolve once shutdown has been signalled
    pub async fn recv(&mut self) {
        // Sender lives in the ShutdownSignal; a dropped sender counts as shutdown
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}
