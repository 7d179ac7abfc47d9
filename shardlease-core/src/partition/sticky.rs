//! Sticky lease policy
//!
//! Maps the raw, externally managed `sticky` attribute of a lease row to the
//! policy the engine applies. Only the two sentinel values carry meaning;
//! anything else behaves like a regular lease.

/// Raw sticky value that pins a shard to its current owner
pub const STICKY_PINNED: i64 = 10;

/// Raw sticky value that asks the current owner to hand the shard back
pub const STICKY_RELEASE_REQUESTED: i64 = 20;

/// Raw value assumed when the attribute is absent from the lease row
pub const STICKY_ABSENT: i64 = -1;

/// Lease policy derived from the sticky attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StickyPolicy {
    /// Standard expiry and ownership rules
    Normal,
    /// Only the recorded owner may hold the lease; never stolen, never
    /// failed over while an owner is recorded
    Pinned,
    /// Nobody may acquire the lease; the current owner must release it
    ReleaseRequested,
}

impl StickyPolicy {
    /// Classify a raw sticky value.
    ///
    /// Exact equality against the sentinels, so new sentinel values can be
    /// introduced later without silently reclassifying existing rows.
    pub fn classify(raw: Option<i64>) -> Self {
        match raw.unwrap_or(STICKY_ABSENT) {
            STICKY_PINNED => StickyPolicy::Pinned,
            STICKY_RELEASE_REQUESTED => StickyPolicy::ReleaseRequested,
            _ => StickyPolicy::Normal,
        }
    }

    /// Whether the rebalancer may move this shard between workers
    pub fn is_stealable(self) -> bool {
        self == StickyPolicy::Normal
    }

    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            StickyPolicy::Normal => "normal",
            StickyPolicy::Pinned => "pinned",
            StickyPolicy::ReleaseRequested => "release_requested",
        }
    }
}

impl std::fmt::Display for StickyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
