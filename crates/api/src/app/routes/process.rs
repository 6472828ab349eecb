//! `POST /process`: the trigger endpoint.

use std::sync::Arc;

use axum::{body::Bytes, extract::Extension, http::StatusCode, response::IntoResponse, Json};

use enrichq_infra::controller::spawn_continuation;

use crate::app::dto::{self, ProcessAction, ProcessRequest};
use crate::app::{errors, services::AppServices};

pub async fn process(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ProcessRequest::default()
    } else {
        match serde_json::from_slice::<ProcessRequest>(&body) {
            Ok(r) => r,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
        }
    };

    let action = match request.action.as_deref() {
        None => None,
        Some(name) => match ProcessAction::parse(name) {
            Some(action) => Some(action),
            None => {
                return errors::json_error(StatusCode::BAD_REQUEST, format!("unknown action: {name}"));
            }
        },
    };

    match action {
        None => run_pass(&services, request.continuation_count()).await,
        Some(ProcessAction::CancelPending) => cancel_pending(&services, request).await,
        Some(ProcessAction::Pause) => set_paused(&services, true).await,
        Some(ProcessAction::Resume) => set_paused(&services, false).await,
    }
}

async fn run_pass(services: &AppServices, continuation_count: u32) -> axum::response::Response {
    let controller = &services.controller;
    let report = match controller.run(continuation_count).await {
        Ok(report) => report,
        Err(e) => return errors::controller_error_to_response(e),
    };

    let response = Json(dto::ProcessResponse::from(&report)).into_response();
    // Never awaited; the response does not depend on it.
    let _ = spawn_continuation(
        Arc::clone(&services.continuation),
        report.continuation,
        controller.config(),
    );
    response
}

async fn cancel_pending(services: &AppServices, request: ProcessRequest) -> axum::response::Response {
    match services.controller.cancel_pending(request.before).await {
        Ok(cancelled) => Json(dto::CancelResponse { cancelled }).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}

async fn set_paused(services: &AppServices, paused: bool) -> axum::response::Response {
    match services.controller.set_paused(paused).await {
        Ok(state) => Json(dto::PauseResponse {
            success: true,
            paused: state.paused,
        })
        .into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}
