//! Lease coordination
//!
//! Assignment loop, per-shard renewal, membership tracking and rebalancing.
//! There is no leader: workers coordinate only through conditional writes
//! to the lease store.

pub mod context;
pub mod event_loop;
pub mod membership;
pub mod rebalancer;
pub mod renewal;

pub use context::LeaseContext;
pub use event_loop::{decide_acquisition, run_tick, Acquisition, SkipReason, TickReport};
pub use membership::{active_workers, MembershipTracker};
pub use rebalancer::{
    rebalance_once, BalancePolicy, RebalanceOutcome, RebalanceReport, RegistrySnapshot, StealPlan,
};
pub use renewal::{renew_once, RenewalExit, RenewalStep};
