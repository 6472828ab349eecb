//! Queue item: one enrichment request and its status machine.
//!
//! ```text
//!            claim              complete
//! pending ──────────► processing ─────────► completed
//!    ▲  │                 │  │
//!    │  │ cancel          │  └── fail / reset_stale (attempts exhausted) ──► failed
//!    │  └──────────► failed
//!    └── release_for_retry / reset_stale ──┘
//! ```
//!
//! A permanent pipeline error also fails an item before its attempts are
//! exhausted.
//!
//! `attempts` is post-increment: after a claim it reflects the count including
//! the claim just made, and it never decreases.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{QueueItemId, TargetId};

/// Lifecycle status of a queue item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one invocation.
    Processing,
    /// Terminal success.
    Completed,
    /// Terminal failure (attempts exhausted, permanent error, or cancelled).
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl core::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(DomainError::validation(format!("unknown item status: {other}"))),
        }
    }
}

/// One row of the enrichment queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub target_id: TargetId,
    pub status: ItemStatus,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Bypasses the already-enriched short-circuit.
    pub force: bool,
}

impl QueueItem {
    /// Create a new pending item.
    pub fn new(target_id: TargetId, force: bool, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: QueueItemId::new(),
            target_id,
            status: ItemStatus::Pending,
            attempts: 0,
            queued_at,
            started_at: None,
            completed_at: None,
            last_error: None,
            force,
        }
    }

    /// Whether this item may be claimed under the given attempt ceiling.
    pub fn is_claimable(&self, max_attempts: u32) -> bool {
        self.status == ItemStatus::Pending && self.attempts < max_attempts
    }

    /// Whether the attempt budget is used up.
    pub fn has_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Whether this item is stuck in `processing` since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Processing && self.started_at.is_some_and(|s| s < cutoff)
    }

    /// pending → processing, `attempts += 1`, `started_at = now`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(ItemStatus::Pending, "claim")?;
        self.status = ItemStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        Ok(())
    }

    /// processing → completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(ItemStatus::Processing, "complete")?;
        self.status = ItemStatus::Completed;
        self.completed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// processing → pending, eligible for a future claim.
    ///
    /// `clear_started` makes the item immediately re-claimable without
    /// waiting for the stale threshold.
    pub fn release_for_retry(
        &mut self,
        error: impl Into<String>,
        clear_started: bool,
    ) -> DomainResult<()> {
        self.expect_status(ItemStatus::Processing, "release")?;
        self.status = ItemStatus::Pending;
        self.last_error = Some(error.into());
        if clear_started {
            self.started_at = None;
        }
        Ok(())
    }

    /// processing → failed.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(ItemStatus::Processing, "fail")?;
        self.status = ItemStatus::Failed;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// processing → pending after a crashed or killed invocation, or
    /// processing → failed when that claim was the last one allowed.
    ///
    /// Returns the new status.
    pub fn reset_stale(
        &mut self,
        marker: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<ItemStatus> {
        self.expect_status(ItemStatus::Processing, "reset")?;
        self.last_error = Some(marker.into());
        if self.has_exhausted(max_attempts) {
            self.status = ItemStatus::Failed;
            self.completed_at = Some(now);
        } else {
            self.status = ItemStatus::Pending;
            self.started_at = None;
        }
        Ok(self.status)
    }

    /// pending → failed by operator cancellation.
    pub fn cancel(&mut self, marker: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(ItemStatus::Pending, "cancel")?;
        self.status = ItemStatus::Failed;
        self.last_error = Some(marker.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn expect_status(&self, expected: ItemStatus, action: &str) -> DomainResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DomainError::transition(format!(
                "cannot {action} item {} in status {}",
                self.id, self.status
            )))
        }
    }
}
