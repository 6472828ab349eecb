//! Per-invocation run record (diagnostics only).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobRunId, QueueItemId};

/// Terminal (or current) status of a job run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobRunStatus::Running),
            "completed" => Some(JobRunStatus::Completed),
            "failed" => Some(JobRunStatus::Failed),
            "paused" => Some(JobRunStatus::Paused),
            _ => None,
        }
    }
}

/// One row per invocation-triggered run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub kind: String,
    pub status: JobRunStatus,
    pub continuation_count: u32,
    pub total_items: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_item_id: Option<QueueItemId>,
    /// How many items had each field written by the pipeline.
    #[serde(default)]
    pub updated_fields: BTreeMap<String, u64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn open(kind: impl Into<String>, continuation_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobRunId::new(),
            kind: kind.into(),
            status: JobRunStatus::Running,
            continuation_count,
            total_items: 0,
            succeeded: 0,
            failed: 0,
            last_item_id: None,
            updated_fields: BTreeMap::new(),
            error: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn record(&mut self, item_id: QueueItemId, success: bool) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.last_item_id = Some(item_id);
    }

    pub fn record_fields<'f>(&mut self, fields: impl IntoIterator<Item = &'f String>) {
        for field in fields {
            *self.updated_fields.entry(field.clone()).or_default() += 1;
        }
    }

    pub fn close(&mut self, status: JobRunStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
    }
}
