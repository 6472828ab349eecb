/// Consecutive-failure counter scoped to one invocation.
///
/// Any success resets it. Once it reaches the threshold, no further chunks
/// are dispatched; already-dispatched items still finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
}

/// How one item outcome affects the breaker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakerSignal {
    Success,
    Failure,
    /// Says nothing about provider health (e.g. a permanently invalid target).
    Neutral,
}

impl CircuitBreaker {
    /// A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record(&mut self, signal: BreakerSignal) {
        match signal {
            BreakerSignal::Success => self.record_success(),
            BreakerSignal::Failure => self.record_failure(),
            BreakerSignal::Neutral => {}
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_consecutive_failures_only() {
        let mut breaker = CircuitBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_tripped());

        breaker.record_failure();
        assert!(breaker.is_tripped());
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[test]
    fn neutral_signals_do_not_reset_or_count() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record(BreakerSignal::Failure);
        breaker.record(BreakerSignal::Neutral);
        assert_eq!(breaker.consecutive_failures(), 1);
        breaker.record(BreakerSignal::Failure);
        assert!(breaker.is_tripped());
    }
}
