//! Batch scheduler: fixed-size chunks, breaker and pause checks, inter-chunk
//! delays stretched by provider cooldowns.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use enrichq_core::QueueItem;
use enrichq_pipeline::EnrichmentPipeline;

use crate::queue::ControllerStore;

use super::breaker::CircuitBreaker;
use super::config::ControllerConfig;
use super::delegate::{dispatch_chunk, settle, ItemReport};
use super::progress::ProgressReporter;

/// Why the chunk loop ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Every chunk was dispatched.
    Drained,
    BudgetExhausted,
    BreakerTripped,
    Paused,
    /// A provider cooldown did not fit in the remaining budget.
    CooldownExceedsBudget { cooldown: Duration },
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Drained => "drained",
            StopReason::BudgetExhausted => "budget exhausted",
            StopReason::BreakerTripped => "circuit breaker tripped",
            StopReason::Paused => "paused by operator",
            StopReason::CooldownExceedsBudget { .. } => "provider cooldown exceeds remaining budget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// One report per dispatched item, chunk by chunk, completion order within a chunk.
    pub reports: Vec<ItemReport>,
    pub stop: StopReason,
    pub chunks_run: usize,
    /// Claimed items never dispatched; they stay `processing`.
    pub undispatched: usize,
}

/// Run `batch` chunk by chunk until it is drained or a stop condition hits.
///
/// Before each chunk, in order: the budget, the breaker and pause flag, then
/// (from the second chunk on) the inter-chunk delay.
pub async fn run_chunks<S, P>(
    store: &S,
    pipeline: &Arc<P>,
    config: &ControllerConfig,
    batch: Vec<QueueItem>,
    deadline: Instant,
    progress: &mut ProgressReporter<'_, S>,
) -> ScheduleOutcome
where
    S: ControllerStore + ?Sized,
    P: EnrichmentPipeline + ?Sized,
{
    let chunk_size = config.concurrency.max(1);
    let total_chunks = batch.len().div_ceil(chunk_size);
    let mut breaker = CircuitBreaker::new(config.breaker_threshold);
    let mut reports = Vec::with_capacity(batch.len());
    let mut cooldown: Option<Duration> = None;
    let mut stop = StopReason::Drained;
    let mut chunks_run = 0;

    for (index, chunk) in batch.chunks(chunk_size).enumerate() {
        let now = Instant::now();
        if now >= deadline {
            stop = StopReason::BudgetExhausted;
            break;
        }
        if breaker.is_tripped() {
            stop = StopReason::BreakerTripped;
            break;
        }
        if is_paused(store, &config.kind).await {
            stop = StopReason::Paused;
            break;
        }

        if index > 0 {
            let delay = cooldown
                .map_or(config.inter_chunk_delay, |c| c.max(config.inter_chunk_delay));
            if delay >= deadline - now {
                stop = match cooldown {
                    Some(c) if c > config.inter_chunk_delay => {
                        StopReason::CooldownExceedsBudget { cooldown: c }
                    }
                    _ => StopReason::BudgetExhausted,
                };
                break;
            }
            debug!(chunk = index, delay_ms = delay.as_millis() as u64, "waiting before next chunk");
            tokio::time::sleep(delay).await;
        }

        debug!(chunk = index, of = total_chunks, items = chunk.len(), "dispatching chunk");
        cooldown = None;
        for dispatched in dispatch_chunk(pipeline, chunk, config.item_timeout).await {
            let report = settle(store, dispatched, config.max_attempts).await;
            breaker.record(report.signal);
            if let Some(c) = report.cooldown {
                cooldown = Some(cooldown.map_or(c, |prev| prev.max(c)));
            }
            progress.record(&report);
            reports.push(report);
        }
        progress.flush().await;
        chunks_run += 1;

        if breaker.is_tripped() && chunks_run < total_chunks {
            warn!(
                consecutive_failures = breaker.consecutive_failures(),
                "circuit breaker tripped, stopping dispatch"
            );
        }
    }

    // A trip on the final chunk leaves nothing undispatched but still matters
    // for the continuation delay.
    if stop == StopReason::Drained && breaker.is_tripped() {
        stop = StopReason::BreakerTripped;
    }

    let undispatched = batch.len() - reports.len();
    if undispatched > 0 {
        info!(undispatched, reason = stop.as_str(), "stopped before dispatching the whole batch");
    }

    ScheduleOutcome {
        reports,
        stop,
        chunks_run,
        undispatched,
    }
}

/// Read the operation's pause flag. An unreadable flag counts as not paused.
pub(super) async fn is_paused<S>(store: &S, kind: &str) -> bool
where
    S: ControllerStore + ?Sized,
{
    match store.load_operation(kind).await {
        Ok(state) => state.is_some_and(|s| s.paused),
        Err(e) => {
            warn!(error = %e, "failed to read pause flag, continuing");
            false
        }
    }
}
