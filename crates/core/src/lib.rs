//! `enrichq-core`: domain foundation for the enrichment queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! queue items and their status machine, the cross-invocation operation row,
//! and the per-invocation job-run record.

pub mod error;
pub mod id;
pub mod job_run;
pub mod operation;
pub mod queue_item;

pub use error::{DomainError, DomainResult};
pub use id::{JobRunId, QueueItemId, TargetId};
pub use job_run::{JobRun, JobRunStatus};
pub use operation::{ErrorEntry, OperationState, OperationStatus, ProgressDelta};
pub use queue_item::{ItemStatus, QueueItem};
