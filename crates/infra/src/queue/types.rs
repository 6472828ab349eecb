//! Queue store request/response types.

use enrichq_core::{DomainError, QueueItem, QueueItemId};
use serde::Serialize;

/// Parameters for one claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub batch_size: u32,
    pub max_attempts: u32,
}

/// Result of the atomic claim path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Post-transition rows, oldest-enqueued first.
    Claimed(Vec<QueueItem>),
    /// The store has no atomic claim primitive; use the compare-and-swap fallback.
    Unsupported,
}

/// What one stale-recovery pass did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Reset to `pending` for another claim.
    pub requeued: u64,
    /// Failed because the stale claim was the last one allowed.
    pub failed: u64,
}

impl StaleRecovery {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Queue counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue item not found: {0}")]
    NotFound(QueueItemId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
