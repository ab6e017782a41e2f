use axum::{extract::State, http::StatusCode, Json};
use crate::models::{HealthResponse, ReadyResponse};
use crate::AppState;
use tracing::debug;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Not ready once shutdown has begun.
pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    debug!("Readiness check requested");
    let sessions = state.registry.stats().sessions as u32;
    if state.registry.is_closing() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "closing".to_string(),
                message: "Service is shutting down".to_string(),
                sessions,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ok".to_string(),
            message: "Service is ready".to_string(),
            sessions,
        }),
    )
}
