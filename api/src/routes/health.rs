use axum::extract::State;
use axum::{Json, Router, routing::get};

use crate::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check endpoint. Reports `degraded` when no dataset could be loaded.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service status and loaded datasets", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let datasets_loaded: Vec<String> = state.datasets.keys().cloned().collect();
    let status = if datasets_loaded.is_empty() { "degraded" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        datasets_loaded,
    })
}
