use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub database: String,
    pub cache: String,
}

const OK: &str = "OK";
const ERROR: &str = "ERROR";

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "All dependencies reachable", body = HealthResponse),
        (status = 503, description = "A dependency is degraded", body = HealthResponse),
    )
)]
#[tracing::instrument(name = "GET /health", skip(state))]
pub async fn health(State(state): State<AppState>) -> Response {
    let database = match state.store.ping().await {
        Ok(()) => OK,
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            ERROR
        }
    };
    let cache = match state.coordinator.ping().await {
        Ok(()) => OK,
        Err(e) => {
            tracing::warn!(error = %e, "cache health check failed");
            ERROR
        }
    };

    let healthy = database == OK && cache == OK;
    let body = HealthResponse {
        status: if healthy { OK } else { ERROR }.to_string(),
        timestamp: Utc::now().timestamp(),
        database: database.to_string(),
        cache: cache.to_string(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
