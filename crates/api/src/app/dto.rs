use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enrichq_infra::controller::{InvocationReport, ItemError};

/// `source` value carried by continuation requests.
pub const SELF_CONTINUATION_SOURCE: &str = "self-continuation";

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /process`. Every field is optional; `{}` is a plain pass.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub action: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub continuation_count: Option<u32>,
}

impl ProcessRequest {
    /// The continuation count, honoured only on continuation requests.
    pub fn continuation_count(&self) -> u32 {
        match self.source.as_deref() {
            Some(SELF_CONTINUATION_SOURCE) => self.continuation_count.unwrap_or(0),
            _ => 0,
        }
    }
}

/// Operator actions accepted in `ProcessRequest::action`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessAction {
    CancelPending,
    Pause,
    Resume,
}

impl ProcessAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel_pending" => Some(Self::CancelPending),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub runs: Option<u32>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<ItemError>,
    pub remaining: u64,
}

impl From<&InvocationReport> for ProcessResponse {
    fn from(report: &InvocationReport) -> Self {
        Self {
            success: true,
            message: report.message.clone(),
            processed: report.processed,
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            errors: report.errors.clone(),
            remaining: report.remaining,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: u64,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub success: bool,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_count_requires_the_continuation_source() {
        let body: ProcessRequest =
            serde_json::from_str(r#"{"source":"self-continuation","continuationCount":4}"#).unwrap();
        assert_eq!(body.continuation_count(), 4);

        let body: ProcessRequest = serde_json::from_str(r#"{"continuationCount":4}"#).unwrap();
        assert_eq!(body.continuation_count(), 0);
    }

    #[test]
    fn cancel_body_parses_rfc3339_cutoff() {
        let body: ProcessRequest =
            serde_json::from_str(r#"{"action":"cancel_pending","before":"2024-05-01T12:00:00Z"}"#).unwrap();
        assert_eq!(body.action.as_deref().and_then(ProcessAction::parse), Some(ProcessAction::CancelPending));
        assert_eq!(body.before.unwrap().to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn unknown_actions_do_not_parse() {
        assert_eq!(ProcessAction::parse("drop_table"), None);
    }
}
