//! Store contracts consumed by the controller.

use chrono::{DateTime, Utc};

use enrichq_core::{JobRun, OperationState, ProgressDelta, QueueItem, QueueItemId, TargetId};

use super::types::{ClaimOutcome, ClaimRequest, QueueStats, QueueStoreError, StaleRecovery};

/// The queue table.
///
/// Every status write after a claim is conditional on the item still being
/// `processing` with the `attempts` value the caller claimed it at. A `false`
/// return means the race was lost (stale-reset, re-claimed elsewhere, or
/// cancelled) and is not an error.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a new pending item.
    async fn enqueue(&self, target_id: TargetId, force: bool) -> Result<QueueItem, QueueStoreError>;

    /// Get an item by id.
    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Atomically claim up to `batch_size` pending items with
    /// `attempts < max_attempts`, oldest first.
    async fn claim_batch(&self, request: ClaimRequest) -> Result<ClaimOutcome, QueueStoreError>;

    /// Read up to `limit` claim candidates, oldest first (fallback path).
    async fn list_pending(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Claim one item only if it is still pending at `expected_attempts`.
    /// Returns the post-transition row, or `None` when another invocation won.
    async fn try_claim(
        &self,
        id: QueueItemId,
        expected_attempts: u32,
    ) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Reset `processing` items started before `started_before` to `pending`,
    /// clearing `started_at` and writing `marker` to `last_error`. Items
    /// already at `max_attempts` go to `failed` instead.
    async fn recover_stale(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
        marker: &str,
    ) -> Result<StaleRecovery, QueueStoreError>;

    async fn complete(&self, id: QueueItemId, attempts: u32) -> Result<bool, QueueStoreError>;

    async fn release_for_retry(
        &self,
        id: QueueItemId,
        attempts: u32,
        error: &str,
        clear_started: bool,
    ) -> Result<bool, QueueStoreError>;

    async fn fail(&self, id: QueueItemId, attempts: u32, error: &str) -> Result<bool, QueueStoreError>;

    /// Move pending items enqueued before `before` to `failed` with `marker`.
    async fn cancel_pending(
        &self,
        before: DateTime<Utc>,
        marker: &str,
    ) -> Result<u64, QueueStoreError>;

    /// Pending items that are still claimable.
    async fn count_pending(&self, max_attempts: u32) -> Result<u64, QueueStoreError>;

    async fn stats(&self) -> Result<QueueStats, QueueStoreError>;
}

/// One progress/pause row per operation kind.
#[async_trait::async_trait]
pub trait OperationStore: Send + Sync + 'static {
    async fn load_operation(&self, kind: &str) -> Result<Option<OperationState>, QueueStoreError>;

    /// Create the row if missing and enter `running` (see [`OperationState::begin`]).
    async fn begin_operation(&self, kind: &str) -> Result<OperationState, QueueStoreError>;

    /// Increment counters and append errors, keeping at most `error_cap` of them.
    async fn record_progress(
        &self,
        kind: &str,
        delta: &ProgressDelta,
        error_cap: usize,
    ) -> Result<(), QueueStoreError>;

    async fn set_remaining(&self, kind: &str, remaining: u64) -> Result<(), QueueStoreError>;

    async fn set_paused(&self, kind: &str, paused: bool) -> Result<OperationState, QueueStoreError>;

    async fn mark_operation_completed(&self, kind: &str) -> Result<(), QueueStoreError>;

    async fn mark_operation_failed(&self, kind: &str, reason: &str) -> Result<(), QueueStoreError>;
}

/// Per-invocation diagnostic records.
#[async_trait::async_trait]
pub trait JobRunStore: Send + Sync + 'static {
    async fn insert_run(&self, run: &JobRun) -> Result<(), QueueStoreError>;

    async fn update_run(&self, run: &JobRun) -> Result<(), QueueStoreError>;

    async fn recent_runs(&self, kind: &str, limit: u32) -> Result<Vec<JobRun>, QueueStoreError>;
}

/// Everything the controller needs from storage.
pub trait ControllerStore: QueueStore + OperationStore + JobRunStore {}

impl<T: QueueStore + OperationStore + JobRunStore> ControllerStore for T {}
