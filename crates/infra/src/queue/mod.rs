//! Durable queue state: items, the operation row, and job-run records.
//!
//! ## Components
//!
//! - `QueueStore`: the queue table (claim, conditional status writes, stale reset, cancel)
//! - `OperationStore`: one progress/pause row per operation kind
//! - `JobRunStore`: per-invocation diagnostic records
//! - `InMemoryStore`: all three, for tests/dev
//! - `PostgresStore`: all three plus target lookup, backed by sqlx

pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{ControllerStore, JobRunStore, OperationStore, QueueStore};
pub use types::{ClaimOutcome, ClaimRequest, QueueStats, QueueStoreError, StaleRecovery};
