//! Error types for the lease engine
//!
//! Error taxonomy covering lease store access, shard coordination,
//! and worker runtime failures.

use thiserror::Error;

/// Primary error type for all lease engine operations
#[derive(Debug, Error)]
pub enum LeaseError {
    // ========== Store Errors ==========

    /// Lease store call failed (network, throttling, backend fault)
    #[error("Lease store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Lease store call exceeded the configured call timeout
    #[error("Lease store {operation} on shard {shard_id} timed out after {timeout_ms}ms")]
    StoreTimeout {
        operation: &'static str,
        shard_id: String,
        timeout_ms: u64,
    },

    /// No lease row exists for the shard
    #[error("No lease record for shard {shard_id}")]
    LeaseNotFound { shard_id: String },

    // ========== Coordination Errors ==========

    /// Shard vanished from the registry (removed by shard sync)
    #[error("Shard {shard_id} is not in the registry")]
    ShardNotFound { shard_id: String },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

impl LeaseError {
    /// Returns true if this error is transient and the operation may be
    /// attempted again on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::StoreUnavailable { .. } | LeaseError::StoreTimeout { .. }
        )
    }

    /// Returns true if the shard or its lease no longer exists
    pub fn is_missing_entry(&self) -> bool {
        matches!(
            self,
            LeaseError::ShardNotFound { .. } | LeaseError::LeaseNotFound { .. }
        )
    }
}

/// Result type alias for lease engine operations
pub type Result<T> = std::result::Result<T, LeaseError>;
