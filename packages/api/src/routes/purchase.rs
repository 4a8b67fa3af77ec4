use axum::extract::{Query, State};
use axum::{routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/purchase", post(purchase))
}

#[derive(Clone, Debug, Deserialize)]
pub struct PurchaseParams {
    pub code: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct PurchaseResponse {
    pub success: bool,
    pub purchase_id: String,
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/purchase",
    tag = "sale",
    params(
        ("code" = String, Query, description = "Checkout code to redeem"),
    ),
    responses(
        (status = 200, description = "Purchase completed", body = PurchaseResponse),
        (status = 400, description = "Missing or invalid/expired code"),
        (status = 403, description = "User purchase limit reached"),
        (status = 409, description = "Sold out or conflicting purchase"),
        (status = 503, description = "Store or coordinator unavailable"),
    )
)]
#[tracing::instrument(name = "POST /purchase", skip(state, params))]
pub async fn purchase(
    State(state): State<AppState>,
    Query(params): Query<PurchaseParams>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let code = params.code.as_deref().unwrap_or_default();

    let purchase_id = state.purchase.purchase(code).await?;
    Ok(Json(PurchaseResponse {
        success: true,
        purchase_id,
        message: "Purchase completed successfully.".into(),
    }))
}
