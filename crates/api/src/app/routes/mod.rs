use axum::{
    routing::{get, post},
    Router,
};

pub mod process;
pub mod system;

/// Router for the trigger and the operator endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/process", post(process::process))
        .route("/status", get(system::status))
}
