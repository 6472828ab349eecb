use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::{dto, errors, services::AppServices};

const DEFAULT_RECENT_RUNS: u32 = 10;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Operation row, queue counts per status and the most recent job runs.
pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::StatusQuery>,
) -> axum::response::Response {
    let runs = query.runs.unwrap_or(DEFAULT_RECENT_RUNS).min(100);
    match services.controller.status(runs).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}
