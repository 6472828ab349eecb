//! Cross-invocation progress row for one operation kind.
//!
//! Invocations are stateless and may overlap, so this state lives in the
//! store and is only ever changed through increments and flag writes. The
//! types here describe the row and the pure arithmetic the in-memory store
//! applies; the Postgres store does the same thing in SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{QueueItemId, TargetId};

/// Status of the operation as a whole.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Never started.
    Idle,
    /// A drain is in progress (possibly across many invocations).
    Running,
    /// The queue emptied.
    Completed,
    /// Stopped loudly (e.g. continuation ceiling reached with backlog left).
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(OperationStatus::Idle),
            "running" => Some(OperationStatus::Running),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

/// One recorded item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub item_id: QueueItemId,
    pub target_id: TargetId,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Counter increments produced by one chunk (or one invocation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub completed: u64,
    pub failed: u64,
    pub errors: Vec<ErrorEntry>,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.completed == 0 && self.failed == 0 && self.errors.is_empty()
    }
}

/// Global progress/pause state for one operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
    pub kind: String,
    pub status: OperationStatus,
    pub paused: bool,
    pub completed_count: u64,
    pub failed_count: u64,
    /// Backlog observed at the end of the latest invocation.
    pub remaining: u64,
    /// Most recent failures, oldest first.
    pub recent_errors: Vec<ErrorEntry>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OperationState {
    pub fn new(kind: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            status: OperationStatus::Idle,
            paused: false,
            completed_count: 0,
            failed_count: 0,
            remaining: 0,
            recent_errors: Vec::new(),
            message: None,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Enter `Running`. A fresh drain (from any non-running status) resets
    /// the counters; a continuation of a running drain keeps them.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        if self.status != OperationStatus::Running {
            self.status = OperationStatus::Running;
            self.completed_count = 0;
            self.failed_count = 0;
            self.recent_errors.clear();
            self.message = None;
            self.started_at = Some(now);
            self.finished_at = None;
        }
        self.updated_at = now;
    }

    /// Apply counter increments, keeping at most `error_cap` recent errors.
    pub fn apply(&mut self, delta: &ProgressDelta, error_cap: usize, now: DateTime<Utc>) {
        self.completed_count += delta.completed;
        self.failed_count += delta.failed;
        self.recent_errors.extend(delta.errors.iter().cloned());
        if self.recent_errors.len() > error_cap {
            let excess = self.recent_errors.len() - error_cap;
            self.recent_errors.drain(..excess);
        }
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Completed;
        self.remaining = 0;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = OperationStatus::Failed;
        self.message = Some(reason.into());
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Share of known work that has reached a terminal state, in percent.
    pub fn progress_percent(&self) -> f64 {
        let done = self.completed_count + self.failed_count;
        let total = done + self.remaining;
        if total == 0 {
            return if self.status == OperationStatus::Completed { 100.0 } else { 0.0 };
        }
        (done as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg: &str) -> ErrorEntry {
        ErrorEntry {
            item_id: QueueItemId::new(),
            target_id: TargetId::new(),
            error: msg.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn begin_resets_only_when_not_running() {
        let now = Utc::now();
        let mut op = OperationState::new("enrichment", now);
        op.begin(now);
        op.apply(
            &ProgressDelta { completed: 4, failed: 1, errors: vec![entry("x")] },
            20,
            now,
        );

        // Continuation of the same drain keeps counters.
        op.begin(now);
        assert_eq!(op.completed_count, 4);

        op.mark_completed(now);
        op.begin(now);
        assert_eq!(op.completed_count, 0);
        assert!(op.recent_errors.is_empty());
    }

    #[test]
    fn recent_errors_are_capped_keeping_newest() {
        let now = Utc::now();
        let mut op = OperationState::new("enrichment", now);
        let errors: Vec<_> = (0..5).map(|i| entry(&format!("e{i}"))).collect();
        op.apply(&ProgressDelta { completed: 0, failed: 5, errors }, 3, now);

        let kept: Vec<_> = op.recent_errors.iter().map(|e| e.error.as_str()).collect();
        assert_eq!(kept, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn progress_percent_uses_remaining_backlog() {
        let now = Utc::now();
        let mut op = OperationState::new("enrichment", now);
        op.begin(now);
        op.apply(&ProgressDelta { completed: 3, failed: 1, errors: vec![] }, 20, now);
        op.remaining = 4;
        assert!((op.progress_percent() - 50.0).abs() < f64::EPSILON);
    }
}
