//! Enrichment queue controller.
//!
//! ## Flow of one invocation
//!
//! 1. Stale recovery (log and continue on failure)
//! 2. Claim a batch (atomic store primitive, compare-and-swap fallback)
//! 3. Skip items whose targets are already enriched, unless forced
//! 4. Run chunks with budget, breaker and pause checks
//! 5. Write item outcomes and progress
//! 6. Plan the continuation
//!
//! Correctness across overlapping invocations rests on the claim protocol and
//! the conditional status writes. Nothing here assumes exclusivity.

pub mod breaker;
pub mod claim;
pub mod config;
pub mod continuation;
pub mod delegate;
pub mod invocation;
pub mod progress;
pub mod scheduler;
pub mod skip;
pub mod stale;

pub use breaker::{BreakerSignal, CircuitBreaker};
pub use config::{ControllerConfig, CANCELLED_MARKER, STALE_RECOVERY_MARKER};
pub use continuation::{
    dispatch_with_retry, plan_continuation, spawn_continuation, ContinuationDispatcher,
    ContinuationError, ContinuationPlan,
};
pub use delegate::{DispatchResult, Disposition, ItemReport};
pub use invocation::{Controller, ControllerError, InvocationReport, ItemError, StatusSnapshot};
pub use scheduler::StopReason;
