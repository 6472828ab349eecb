//! One controller invocation, plus the operator actions around it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use enrichq_core::{JobRun, JobRunStatus, OperationState, ProgressDelta, QueueItemId, TargetId};
use enrichq_pipeline::{EnrichmentPipeline, TargetLookup};

use crate::queue::{ClaimRequest, ControllerStore, QueueStats, QueueStoreError, StaleRecovery};

use super::claim::claim_batch;
use super::config::{ControllerConfig, CANCELLED_MARKER};
use super::continuation::{plan_continuation, ContinuationPlan};
use super::delegate::Disposition;
use super::progress::ProgressReporter;
use super::scheduler::{is_paused, run_chunks, StopReason};
use super::skip::{complete_satisfied, partition_satisfied};
use super::stale::recover_stale;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The store could not be reached while claiming work.
    #[error("claim failed: {0}")]
    Claim(#[source] QueueStoreError),

    #[error("store error: {0}")]
    Store(#[from] QueueStoreError),
}

/// One failed item, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub item_id: QueueItemId,
    pub target_id: TargetId,
    pub error: String,
}

/// Summary of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub continuation_count: u32,
    /// Stale claims handed back to the queue.
    pub stale_recovered: u64,
    /// Stale claims failed because their attempts were used up.
    pub stale_failed: u64,
    pub claimed: usize,
    /// Dispatched plus skipped.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<ItemError>,
    /// Claimable pending items after this invocation.
    pub remaining: u64,
    pub stop: StopReason,
    pub continuation: ContinuationPlan,
    pub message: String,
}

/// Operator view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub operation: Option<OperationState>,
    pub queue: QueueStats,
    pub recent_runs: Vec<JobRun>,
    pub progress_percent: f64,
}

/// The enrichment queue controller.
///
/// Stateless between invocations: everything that must survive lives in the
/// store, so any number of invocations may overlap.
pub struct Controller<S: ?Sized> {
    store: Arc<S>,
    pipeline: Arc<dyn EnrichmentPipeline>,
    targets: Arc<dyn TargetLookup>,
    config: ControllerConfig,
}

impl<S> Controller<S>
where
    S: ControllerStore + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        pipeline: Arc<dyn EnrichmentPipeline>,
        targets: Arc<dyn TargetLookup>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            targets,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one invocation: recover stale, claim, skip, run chunks, report,
    /// plan the continuation.
    ///
    /// Only a store failure while claiming is an error. Everything else ends
    /// up in the report.
    pub async fn run(&self, continuation_count: u32) -> Result<InvocationReport, ControllerError> {
        let deadline = Instant::now() + self.config.budget;
        let store = &*self.store;
        let kind = self.config.kind.as_str();

        let stale = recover_stale(
            store,
            self.config.stale_threshold,
            self.config.max_attempts,
            Utc::now(),
        )
        .await;
        if stale.failed > 0 {
            self.record_stale_failures(stale.failed).await;
        }

        if is_paused(store, kind).await {
            info!(continuation_count, "operation paused, not claiming");
            let mut report = empty_report(continuation_count, stale, StopReason::Paused, "Operation paused");
            report.remaining = self.count_remaining().await;
            return Ok(report);
        }

        let batch = claim_batch(
            store,
            ClaimRequest {
                batch_size: self.config.batch_size,
                max_attempts: self.config.max_attempts,
            },
        )
        .await
        .map_err(|e| {
            error!(error = %e, continuation_count, "claim failed");
            ControllerError::Claim(e)
        })?;

        if batch.is_empty() {
            return Ok(self.finish_idle(continuation_count, stale).await);
        }

        let claimed = batch.len();
        info!(claimed, continuation_count, "claimed batch");
        if let Err(e) = store.begin_operation(kind).await {
            warn!(error = %e, "failed to mark operation running");
        }

        let mut progress = ProgressReporter::open(
            store,
            kind,
            continuation_count,
            claimed as u64,
            self.config.error_ring_size,
        )
        .await;

        let partition = partition_satisfied(&*self.targets, batch).await;
        let skipped = complete_satisfied(store, partition.satisfied).await;
        for item in &skipped {
            progress.record_skipped(item);
        }

        let outcome = run_chunks(
            store,
            &self.pipeline,
            &self.config,
            partition.to_process,
            deadline,
            &mut progress,
        )
        .await;

        let remaining = self.count_remaining().await;
        if let Err(e) = store.set_remaining(kind, remaining).await {
            warn!(error = %e, "failed to record remaining backlog");
        }

        let continuation = plan_continuation(&self.config, continuation_count, remaining, outcome.stop);
        let run_status = self.settle_operation(continuation, remaining, outcome.stop).await;
        let run_error = match (continuation, outcome.stop) {
            (ContinuationPlan::CeilingReached { remaining }, _) => {
                Some(format!("continuation ceiling reached with {remaining} items pending"))
            }
            (_, StopReason::Drained) => None,
            (_, stop) => Some(stop.as_str().to_string()),
        };
        progress.close(run_status, run_error).await;

        let mut report = InvocationReport {
            continuation_count,
            stale_recovered: stale.requeued,
            stale_failed: stale.failed,
            claimed,
            processed: outcome.reports.len() + skipped.len(),
            succeeded: 0,
            failed: 0,
            skipped: skipped.len(),
            errors: Vec::new(),
            remaining,
            stop: outcome.stop,
            continuation,
            message: String::new(),
        };
        for item in &outcome.reports {
            if item.succeeded() {
                report.succeeded += 1;
            } else if item.is_failure() {
                report.failed += 1;
            }
            if item.disposition != Disposition::RaceLost {
                if let Some(error) = &item.error {
                    report.errors.push(ItemError {
                        item_id: item.item_id,
                        target_id: item.target_id,
                        error: error.clone(),
                    });
                }
            }
        }
        report.message = summarize(&report);

        info!(
            continuation_count,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            remaining,
            stop = outcome.stop.as_str(),
            "invocation finished"
        );
        Ok(report)
    }

    /// Move pending items enqueued before `before` (default now) to `failed`.
    pub async fn cancel_pending(&self, before: Option<DateTime<Utc>>) -> Result<u64, ControllerError> {
        let before = before.unwrap_or_else(Utc::now);
        let cancelled = self.store.cancel_pending(before, CANCELLED_MARKER).await?;
        info!(cancelled, %before, "cancelled pending items");

        let remaining = self.store.count_pending(self.config.max_attempts).await?;
        if let Err(e) = self.store.set_remaining(&self.config.kind, remaining).await {
            warn!(error = %e, "failed to record remaining backlog");
        }
        Ok(cancelled)
    }

    pub async fn set_paused(&self, paused: bool) -> Result<OperationState, ControllerError> {
        let state = self.store.set_paused(&self.config.kind, paused).await?;
        info!(paused, kind = %self.config.kind, "operation pause flag set");
        Ok(state)
    }

    pub async fn status(&self, recent_runs: u32) -> Result<StatusSnapshot, ControllerError> {
        let operation = self.store.load_operation(&self.config.kind).await?;
        let queue = self.store.stats().await?;
        let recent_runs = self.store.recent_runs(&self.config.kind, recent_runs).await?;
        let progress_percent = operation.as_ref().map_or(0.0, OperationState::progress_percent);
        Ok(StatusSnapshot {
            operation,
            queue,
            recent_runs,
            progress_percent,
        })
    }

    async fn finish_idle(&self, continuation_count: u32, stale: StaleRecovery) -> InvocationReport {
        let store = &*self.store;
        let kind = self.config.kind.as_str();

        // Another invocation may still hold claims; it completes the operation
        // when it finishes.
        match store.stats().await {
            Ok(stats) if stats.processing == 0 => {
                if let Err(e) = store.mark_operation_completed(kind).await {
                    warn!(error = %e, "failed to mark operation completed");
                }
            }
            Ok(stats) => info!(processing = stats.processing, "queue drained, claims still in flight"),
            Err(e) => warn!(error = %e, "failed to read queue stats"),
        }

        empty_report(continuation_count, stale, StopReason::Drained, "No pending items")
    }

    /// Count stale claims that ran out of attempts against the current drain.
    async fn record_stale_failures(&self, failed: u64) {
        let store = &*self.store;
        let kind = self.config.kind.as_str();
        if let Err(e) = store.begin_operation(kind).await {
            warn!(error = %e, "failed to mark operation running");
        }
        let delta = ProgressDelta {
            completed: 0,
            failed,
            errors: Vec::new(),
        };
        if let Err(e) = store.record_progress(kind, &delta, self.config.error_ring_size).await {
            warn!(error = %e, failed, "failed to record stale failures");
        }
    }

    /// Claimable backlog, or 0 when the store cannot say.
    async fn count_remaining(&self) -> u64 {
        match self.store.count_pending(self.config.max_attempts).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to count remaining items");
                0
            }
        }
    }

    /// Update the operation row for the end of a non-empty invocation and
    /// pick the job-run status.
    async fn settle_operation(
        &self,
        continuation: ContinuationPlan,
        remaining: u64,
        stop: StopReason,
    ) -> JobRunStatus {
        let store = &*self.store;
        let kind = self.config.kind.as_str();

        if let ContinuationPlan::CeilingReached { remaining } = continuation {
            let reason = format!(
                "continuation ceiling of {} reached with {remaining} items pending",
                self.config.max_continuations
            );
            error!(remaining, "continuation ceiling reached, marking operation failed");
            if let Err(e) = store.mark_operation_failed(kind, &reason).await {
                warn!(error = %e, "failed to mark operation failed");
            }
            return JobRunStatus::Failed;
        }

        if remaining == 0 {
            match store.stats().await {
                Ok(stats) if stats.processing == 0 => {
                    if let Err(e) = store.mark_operation_completed(kind).await {
                        warn!(error = %e, "failed to mark operation completed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to read queue stats"),
            }
        }

        match stop {
            StopReason::Paused => JobRunStatus::Paused,
            _ => JobRunStatus::Completed,
        }
    }
}

fn empty_report(
    continuation_count: u32,
    stale: StaleRecovery,
    stop: StopReason,
    message: &str,
) -> InvocationReport {
    InvocationReport {
        continuation_count,
        stale_recovered: stale.requeued,
        stale_failed: stale.failed,
        claimed: 0,
        processed: 0,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        errors: Vec::new(),
        remaining: 0,
        stop,
        continuation: ContinuationPlan::Idle,
        message: message.to_string(),
    }
}

fn summarize(report: &InvocationReport) -> String {
    let mut message = format!(
        "Processed {} items ({} succeeded, {} failed, {} skipped), {} remaining",
        report.processed, report.succeeded, report.failed, report.skipped, report.remaining
    );
    if report.stop != StopReason::Drained {
        message.push_str(&format!("; stopped: {}", report.stop.as_str()));
    }
    match report.continuation {
        ContinuationPlan::Continue { next_count, .. } => {
            message.push_str(&format!("; continuing as #{next_count}"));
        }
        ContinuationPlan::CeilingReached { .. } => {
            message.push_str("; continuation ceiling reached");
        }
        ContinuationPlan::Idle => {}
    }
    message
}
