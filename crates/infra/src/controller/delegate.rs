//! Pipeline delegate: dispatch one chunk concurrently, then write each outcome
//! back to the queue.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use enrichq_core::{QueueItem, QueueItemId, TargetId};
use enrichq_pipeline::{EnrichRequest, Enriched, EnrichmentPipeline, PipelineError};

use crate::queue::{QueueStore, QueueStoreError};

use super::breaker::BreakerSignal;

/// Raw result of one pipeline call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Enriched(Enriched),
    Failed(PipelineError),
    TimedOut(Duration),
    /// The dispatch task panicked or was aborted.
    Crashed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub item: QueueItem,
    pub result: DispatchResult,
}

/// What ended up on the queue row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Back to `pending` for a later claim.
    Retrying,
    Failed,
    /// The row was no longer ours (stale-reset, re-claimed or cancelled).
    RaceLost,
    /// The store write failed; the row stays `processing` until stale recovery.
    Unsettled,
}

/// Settled outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: QueueItemId,
    pub target_id: TargetId,
    pub attempts: u32,
    pub disposition: Disposition,
    pub signal: BreakerSignal,
    pub error: Option<String>,
    pub updated_fields: Vec<String>,
    /// Provider-requested cooldown carried by the failure, if any.
    pub cooldown: Option<Duration>,
}

impl ItemReport {
    pub fn succeeded(&self) -> bool {
        self.disposition == Disposition::Completed
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Retrying | Disposition::Failed | Disposition::Unsettled
        )
    }
}

/// Run every item of `chunk` concurrently, each bounded by `timeout`.
///
/// Results arrive in completion order.
pub async fn dispatch_chunk<P>(pipeline: &Arc<P>, chunk: &[QueueItem], timeout: Duration) -> Vec<Dispatched>
where
    P: EnrichmentPipeline + ?Sized,
{
    let mut in_flight = FuturesUnordered::new();
    for item in chunk {
        let pipeline = Arc::clone(pipeline);
        let request = EnrichRequest::new(item.target_id);
        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, pipeline.enrich(request)).await
        });

        let item = item.clone();
        in_flight.push(async move {
            let result = match task.await {
                Ok(Ok(Ok(enriched))) => DispatchResult::Enriched(enriched),
                Ok(Ok(Err(e))) => DispatchResult::Failed(e),
                Ok(Err(_elapsed)) => DispatchResult::TimedOut(timeout),
                Err(join_err) => DispatchResult::Crashed(join_err.to_string()),
            };
            Dispatched { item, result }
        });
    }

    let mut results = Vec::with_capacity(chunk.len());
    while let Some(dispatched) = in_flight.next().await {
        results.push(dispatched);
    }
    results
}

/// Write one dispatch result back to the queue.
///
/// Never fails: store errors leave the row `processing` and are reported as
/// [`Disposition::Unsettled`].
pub async fn settle<S>(store: &S, dispatched: Dispatched, max_attempts: u32) -> ItemReport
where
    S: QueueStore + ?Sized,
{
    let Dispatched { item, result } = dispatched;
    let mut report = ItemReport {
        item_id: item.id,
        target_id: item.target_id,
        attempts: item.attempts,
        disposition: Disposition::Completed,
        signal: BreakerSignal::Success,
        error: None,
        updated_fields: Vec::new(),
        cooldown: None,
    };

    let write = match result {
        DispatchResult::Enriched(enriched) => {
            info!(
                item_id = %item.id,
                target_id = %item.target_id,
                updated_fields = ?enriched.updated_fields,
                "item enriched"
            );
            report.updated_fields = enriched.updated_fields;
            store.complete(item.id, item.attempts).await
        }
        DispatchResult::Failed(e) if e.is_conflict() => {
            debug!(item_id = %item.id, "target enriched concurrently, treating as success");
            store.complete(item.id, item.attempts).await
        }
        DispatchResult::Failed(e) if e.is_permanent() => {
            let message = e.to_string();
            report.signal = BreakerSignal::Neutral;
            report.disposition = Disposition::Failed;
            report.error = Some(message.clone());
            store.fail(item.id, item.attempts, &message).await
        }
        DispatchResult::Failed(e) => {
            report.cooldown = e.cooldown();
            retry_or_fail(store, &item, e.to_string(), false, max_attempts, &mut report).await
        }
        DispatchResult::TimedOut(after) => {
            let message = format!("timed out after {}s", after.as_secs());
            retry_or_fail(store, &item, message, false, max_attempts, &mut report).await
        }
        DispatchResult::Crashed(reason) => {
            let message = format!("dispatch crashed: {reason}");
            retry_or_fail(store, &item, message, true, max_attempts, &mut report).await
        }
    };

    match write {
        Ok(true) => {}
        Ok(false) => {
            debug!(item_id = %item.id, attempts = item.attempts, "settle race lost");
            report.disposition = Disposition::RaceLost;
        }
        Err(e) => {
            error!(item_id = %item.id, error = %e, "failed to write item outcome");
            report.disposition = Disposition::Unsettled;
            report.error.get_or_insert_with(|| format!("store write failed: {e}"));
        }
    }

    if report.is_failure() {
        warn!(
            item_id = %item.id,
            target_id = %item.target_id,
            attempts = item.attempts,
            disposition = ?report.disposition,
            error = report.error.as_deref().unwrap_or_default(),
            "item failed"
        );
    }
    report
}

async fn retry_or_fail<S>(
    store: &S,
    item: &QueueItem,
    message: String,
    clear_started: bool,
    max_attempts: u32,
    report: &mut ItemReport,
) -> Result<bool, QueueStoreError>
where
    S: QueueStore + ?Sized,
{
    report.signal = BreakerSignal::Failure;
    let write = if item.has_exhausted(max_attempts) {
        report.disposition = Disposition::Failed;
        store.fail(item.id, item.attempts, &message).await
    } else {
        report.disposition = Disposition::Retrying;
        store
            .release_for_retry(item.id, item.attempts, &message, clear_started)
            .await
    };
    report.error = Some(message);
    write
}
