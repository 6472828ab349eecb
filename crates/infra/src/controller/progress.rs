//! Progress reporter: operation-row counters plus the per-invocation job run.
//!
//! Both writes are best-effort. Failures are logged and never reach the
//! scheduler.

use chrono::Utc;
use tracing::warn;

use enrichq_core::{ErrorEntry, JobRun, JobRunStatus, ProgressDelta, QueueItem};

use crate::queue::{JobRunStore, OperationStore};

use super::delegate::{Disposition, ItemReport};

pub struct ProgressReporter<'a, S: ?Sized> {
    store: &'a S,
    kind: String,
    error_cap: usize,
    /// `None` once a job-run write has failed; later updates are skipped.
    run: Option<JobRun>,
    pending: ProgressDelta,
}

impl<'a, S> ProgressReporter<'a, S>
where
    S: OperationStore + JobRunStore + ?Sized,
{
    /// Open the job run for this invocation.
    pub async fn open(
        store: &'a S,
        kind: impl Into<String>,
        continuation_count: u32,
        total_items: u64,
        error_cap: usize,
    ) -> Self {
        let kind = kind.into();
        let mut run = JobRun::open(kind.clone(), continuation_count, Utc::now());
        run.total_items = total_items;

        let run = match store.insert_run(&run).await {
            Ok(()) => Some(run),
            Err(e) => {
                warn!(kind = %kind, error = %e, "failed to open job run");
                None
            }
        };

        Self {
            store,
            kind,
            error_cap,
            run,
            pending: ProgressDelta::default(),
        }
    }

    /// An item skipped because its target was already enriched.
    pub fn record_skipped(&mut self, item: &QueueItem) {
        self.pending.completed += 1;
        if let Some(run) = self.run.as_mut() {
            run.record(item.id, true);
        }
    }

    pub fn record(&mut self, report: &ItemReport) {
        match report.disposition {
            Disposition::Completed => self.pending.completed += 1,
            Disposition::Failed => self.pending.failed += 1,
            Disposition::Retrying | Disposition::RaceLost | Disposition::Unsettled => {}
        }
        if let Some(error) = report.error.as_ref().filter(|_| report.is_failure()) {
            self.pending.errors.push(ErrorEntry {
                item_id: report.item_id,
                target_id: report.target_id,
                error: error.clone(),
                at: Utc::now(),
            });
        }
        if report.disposition != Disposition::RaceLost {
            if let Some(run) = self.run.as_mut() {
                run.record(report.item_id, report.succeeded());
                if report.succeeded() {
                    run.record_fields(&report.updated_fields);
                }
            }
        }
    }

    /// Push accumulated counters and the job run to the store.
    pub async fn flush(&mut self) {
        let delta = std::mem::take(&mut self.pending);
        if !delta.is_empty() {
            if let Err(e) = self
                .store
                .record_progress(&self.kind, &delta, self.error_cap)
                .await
            {
                warn!(kind = %self.kind, error = %e, "failed to record progress");
            }
        }
        self.write_run().await;
    }

    /// Flush and close the job run.
    pub async fn close(mut self, status: JobRunStatus, error: Option<String>) -> Option<JobRun> {
        if let Some(run) = self.run.as_mut() {
            run.close(status, error, Utc::now());
        }
        self.flush().await;
        self.run
    }

    async fn write_run(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        if let Err(e) = self.store.update_run(run).await {
            warn!(run_id = %run.id, error = %e, "failed to update job run");
            self.run = None;
        }
    }
}
