//! Self-continuation over HTTP: re-trigger this service's own endpoint.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use enrichq_infra::controller::{ContinuationDispatcher, ContinuationError};

use crate::app::dto::SELF_CONTINUATION_SOURCE;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContinuationBody {
    source: &'static str,
    continuation_count: u32,
}

pub struct HttpContinuationDispatcher {
    client: Client,
    url: String,
}

impl HttpContinuationDispatcher {
    /// `timeout` must outlast a whole invocation: the continued invocation
    /// answers only after it finishes.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ContinuationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContinuationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ContinuationDispatcher for HttpContinuationDispatcher {
    async fn dispatch(&self, continuation_count: u32) -> Result<(), ContinuationError> {
        let res = self
            .client
            .post(&self.url)
            .json(&ContinuationBody {
                source: SELF_CONTINUATION_SOURCE,
                continuation_count,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ContinuationError::Unreachable(e.to_string())
                } else {
                    ContinuationError::Transport(e.to_string())
                }
            })?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        Err(ContinuationError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
