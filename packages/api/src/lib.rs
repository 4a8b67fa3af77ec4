use std::time::Duration;

use axum::{middleware::from_fn_with_state, routing::get, Json, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod checkout;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod middleware;
pub mod openapi;
pub mod purchase;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;

pub use axum;

use state::AppState;

/// Hard deadline for every request; work not finished by then is dropped.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub fn warn_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info")
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("hyper_util=warn".parse().unwrap())
            .add_directive("tokio=warn".parse().unwrap())
            .add_directive("tower=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
    })
}

pub fn construct_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(service_info))
        .merge(routes::checkout::routes())
        .merge(routes::purchase::routes())
        .merge(routes::stats::routes())
        .merge(routes::health::routes())
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    axum::http::StatusCode::REQUEST_TIMEOUT,
                    REQUEST_TIMEOUT,
                )),
        );

    Router::new()
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
        )
        .merge(router)
}

#[tracing::instrument(name = "GET /")]
async fn service_info() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Flash sale service is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
