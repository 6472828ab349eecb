//! Controller constants.

use std::time::Duration;

/// `last_error` written by stale recovery.
pub const STALE_RECOVERY_MARKER: &str = "auto-recovered: processing exceeded stale threshold";

/// `last_error` written by bulk cancellation.
pub const CANCELLED_MARKER: &str = "cancelled by operator";

/// Every fixed knob of one controller invocation.
///
/// `Default` reproduces the production values; tests override fields with the
/// `with_*` builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Operation kind keyed in the operation-state and job-run tables.
    pub kind: String,
    /// Items claimed per invocation.
    pub batch_size: u32,
    /// Items dispatched concurrently per chunk.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub item_timeout: Duration,
    pub inter_chunk_delay: Duration,
    /// `processing` items older than this are reset by stale recovery.
    pub stale_threshold: Duration,
    /// Consecutive failures that stop dispatch for the rest of the invocation.
    pub breaker_threshold: u32,
    /// Wall-clock budget of one invocation.
    pub budget: Duration,
    pub max_continuations: u32,
    /// Continuation delay after a breaker trip: base plus uniform jitter.
    pub breaker_delay_base: Duration,
    pub breaker_delay_jitter: Duration,
    /// Attempts (not retries) for one continuation dispatch.
    pub continuation_attempts: u32,
    /// Linear backoff step between continuation dispatch attempts.
    pub continuation_backoff: Duration,
    /// Recent errors kept on the operation row.
    pub error_ring_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kind: "enrichment".to_string(),
            batch_size: 10,
            concurrency: 5,
            max_attempts: 3,
            item_timeout: Duration::from_secs(60),
            inter_chunk_delay: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(10 * 60),
            breaker_threshold: 3,
            budget: Duration::from_secs(120),
            max_continuations: 25,
            breaker_delay_base: Duration::from_secs(30),
            breaker_delay_jitter: Duration::from_secs(15),
            continuation_attempts: 3,
            continuation_backoff: Duration::from_millis(500),
            error_ring_size: 20,
        }
    }
}

impl ControllerConfig {
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = delay;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = threshold;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_continuations(mut self, max: u32) -> Self {
        self.max_continuations = max;
        self
    }

    pub fn with_breaker_delay(mut self, base: Duration, jitter: Duration) -> Self {
        self.breaker_delay_base = base;
        self.breaker_delay_jitter = jitter;
        self
    }

    pub fn with_continuation_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.continuation_attempts = attempts;
        self.continuation_backoff = backoff;
        self
    }
}
