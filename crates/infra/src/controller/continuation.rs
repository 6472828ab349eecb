//! Self-continuation: decide whether another invocation should follow this
//! one, and deliver that request with a short retry loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::ControllerConfig;
use super::scheduler::StopReason;

/// What should happen after this invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContinuationPlan {
    /// Nothing to do (empty backlog or paused).
    Idle,
    /// Trigger invocation `next_count` after `delay`.
    Continue { next_count: u32, delay: Duration },
    /// Backlog remains but the continuation ceiling is reached.
    CeilingReached { remaining: u64 },
}

/// Decide the follow-up for an invocation that ran with `continuation_count`.
pub fn plan_continuation(
    config: &ControllerConfig,
    continuation_count: u32,
    remaining: u64,
    stop: StopReason,
) -> ContinuationPlan {
    if remaining == 0 || stop == StopReason::Paused {
        return ContinuationPlan::Idle;
    }
    if continuation_count >= config.max_continuations {
        return ContinuationPlan::CeilingReached { remaining };
    }

    let delay = match stop {
        StopReason::BreakerTripped => breaker_delay(config),
        StopReason::CooldownExceedsBudget { cooldown } => cooldown,
        _ => Duration::ZERO,
    };
    ContinuationPlan::Continue {
        next_count: continuation_count + 1,
        delay,
    }
}

/// Base plus uniform jitter.
fn breaker_delay(config: &ControllerConfig) -> Duration {
    let jitter_ms = config.breaker_delay_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_ms)
    };
    config.breaker_delay_base + Duration::from_millis(jitter)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContinuationError {
    /// The request never reached the endpoint (connection refused, DNS).
    #[error("continuation endpoint unreachable: {0}")]
    Unreachable(String),

    /// The request may have been delivered; the outcome is unknown.
    #[error("continuation transport error: {0}")]
    Transport(String),

    #[error("continuation rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ContinuationError {
    /// Whether another attempt cannot start a second invocation.
    ///
    /// A gateway 502/503 means the request was not forwarded. A timeout or a
    /// reset after sending may have started one already.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Transport(_) => false,
            Self::Rejected { status, .. } => matches!(status, 502 | 503),
        }
    }
}

/// Delivers a continuation request to the next invocation.
#[async_trait::async_trait]
pub trait ContinuationDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, continuation_count: u32) -> Result<(), ContinuationError>;
}

/// Try up to `attempts` times with linear backoff (`backoff`, `2 * backoff`, ...).
///
/// Only errors where the request provably did not start an invocation are
/// retried.
pub async fn dispatch_with_retry<D>(
    dispatcher: &D,
    continuation_count: u32,
    attempts: u32,
    backoff: Duration,
) -> Result<(), ContinuationError>
where
    D: ContinuationDispatcher + ?Sized,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match dispatcher.dispatch(continuation_count).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts || !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(attempt, continuation_count, error = %e, "continuation dispatch failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
        }
    }
}

/// Fire the planned continuation in the background.
///
/// The current invocation has already produced its result; exhausting the
/// retries is logged only.
pub fn spawn_continuation(
    dispatcher: Arc<dyn ContinuationDispatcher>,
    plan: ContinuationPlan,
    config: &ControllerConfig,
) -> Option<JoinHandle<()>> {
    let ContinuationPlan::Continue { next_count, delay } = plan else {
        return None;
    };
    let attempts = config.continuation_attempts;
    let backoff = config.continuation_backoff;

    Some(tokio::spawn(async move {
        if !delay.is_zero() {
            info!(next_count, delay_ms = delay.as_millis() as u64, "delaying continuation");
            tokio::time::sleep(delay).await;
        }
        match dispatch_with_retry(&*dispatcher, next_count, attempts, backoff).await {
            Ok(()) => info!(next_count, "continuation dispatched"),
            Err(e) => error!(next_count, error = %e, "continuation dispatch gave up"),
        }
    }))
}
