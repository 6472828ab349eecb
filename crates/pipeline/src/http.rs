//! Enrichment pipeline backed by an HTTP enrichment service.
//!
//! The service receives `{ targetId, skipCoveredSteps }` and answers:
//! - 2xx with `{ updatedFields: [...] }` on success
//! - 409 when another worker already enriched the target
//! - 404 when the target does not exist
//! - 422 when the target can never be enriched
//! - 429 (optionally with `Retry-After` seconds) when rate limited
//! - anything else is a provider failure

use std::time::Duration;

use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::Serialize;
use tracing::debug;

use enrichq_core::TargetId;

use crate::outcome::{Enriched, PipelineError};
use crate::pipeline::{EnrichRequest, EnrichmentPipeline};

/// Connection settings for [`HttpEnrichmentPipeline`].
#[derive(Debug, Clone)]
pub struct HttpPipelineConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    /// Client-side ceiling. The controller applies its own per-item timeout on top.
    pub timeout: Duration,
}

impl HttpPipelineConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            timeout: Duration::from_secs(90),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrichBody {
    target_id: TargetId,
    skip_covered_steps: bool,
}

pub struct HttpEnrichmentPipeline {
    config: HttpPipelineConfig,
    client: Client,
}

impl HttpEnrichmentPipeline {
    pub fn new(config: HttpPipelineConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait::async_trait]
impl EnrichmentPipeline for HttpEnrichmentPipeline {
    async fn enrich(&self, request: EnrichRequest) -> Result<Enriched, PipelineError> {
        let mut req = self.client.post(&self.config.endpoint).json(&EnrichBody {
            target_id: request.target_id,
            skip_covered_steps: request.skip_covered_steps,
        });
        if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token);
        }

        let res = req
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let status = res.status();
        debug!(target_id = %request.target_id, status = %status, "enrichment service responded");

        match status {
            s if s.is_success() => res
                .json::<Enriched>()
                .await
                .map_err(|e| PipelineError::Provider(format!("malformed response: {e}"))),
            StatusCode::CONFLICT => Err(PipelineError::Conflict),
            StatusCode::NOT_FOUND => Err(PipelineError::TargetNotFound(request.target_id.to_string())),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = res.text().await.unwrap_or_default();
                Err(PipelineError::InvalidTarget(body))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = res
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(PipelineError::RateLimited { retry_after })
            }
            other => {
                let body = res.text().await.unwrap_or_default();
                Err(PipelineError::Provider(format!("{other}: {body}")))
            }
        }
    }
}
