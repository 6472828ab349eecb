use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use enrichq_infra::ControllerError;

pub fn controller_error_to_response(err: ControllerError) -> axum::response::Response {
    tracing::error!(error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// `{ "success": false, "error": message }` with `status`.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": message.into(),
        })),
    )
        .into_response()
}
