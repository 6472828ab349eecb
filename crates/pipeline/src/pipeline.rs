use enrichq_core::TargetId;

use crate::outcome::{Enriched, PipelineError};

/// Input for one enrichment call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EnrichRequest {
    pub target_id: TargetId,
    /// Skip sub-steps the orchestration already covers (the already-enriched
    /// check has been done by the controller).
    pub skip_covered_steps: bool,
}

impl EnrichRequest {
    pub fn new(target_id: TargetId) -> Self {
        Self {
            target_id,
            skip_covered_steps: true,
        }
    }
}

/// The external enrichment routine for one target.
///
/// Implementations must make their writes idempotent: the queue delivers
/// at-least-once, and a timed-out call may still finish on the provider side.
#[async_trait::async_trait]
pub trait EnrichmentPipeline: Send + Sync + 'static {
    async fn enrich(&self, request: EnrichRequest) -> Result<Enriched, PipelineError>;
}

#[async_trait::async_trait]
impl<P: EnrichmentPipeline + ?Sized> EnrichmentPipeline for std::sync::Arc<P> {
    async fn enrich(&self, request: EnrichRequest) -> Result<Enriched, PipelineError> {
        (**self).enrich(request).await
    }
}
