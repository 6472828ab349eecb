use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Successful enrichment of one target.
///
/// This is *not* a queue status. The controller decides what to write back to
/// the queue row based on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enriched {
    /// Names of the target fields the pipeline wrote.
    #[serde(default)]
    pub updated_fields: Vec<String>,
}

impl Enriched {
    pub fn new(updated_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            updated_fields: updated_fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Another invocation already enriched this target concurrently.
    #[error("target already enriched concurrently")]
    Conflict,

    /// Provider asked us to back off.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The target record does not exist.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// The target exists but can never be enriched (malformed data).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Provider-side failure (5xx, bad payload, extraction error).
    #[error("provider failure: {0}")]
    Provider(String),

    /// Network-level failure reaching the provider.
    #[error("transport error: {0}")]
    Transport(String),
}

impl PipelineError {
    /// The "lost the race to another worker" outcome. Callers treat it as success.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Conflict)
    }

    /// Failures that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::TargetNotFound(_) | PipelineError::InvalidTarget(_)
        )
    }

    /// Provider-requested cooldown, if any.
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
