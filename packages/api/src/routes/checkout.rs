use axum::extract::{Query, State};
use axum::{routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/checkout", post(checkout))
}

#[derive(Clone, Debug, Deserialize)]
pub struct CheckoutParams {
    pub user_id: Option<String>,
    /// Item id; named `id` on the wire.
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct CheckoutResponse {
    pub success: bool,
    pub checkout_code: String,
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/checkout",
    tag = "sale",
    params(
        ("user_id" = String, Query, description = "User performing the checkout"),
        ("id" = String, Query, description = "Item to check out"),
    ),
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Missing parameters or unknown item"),
        (status = 403, description = "User purchase limit reached"),
        (status = 409, description = "No active sale"),
        (status = 503, description = "Store or coordinator unavailable"),
    )
)]
#[tracing::instrument(name = "POST /checkout", skip(state, params))]
pub async fn checkout(
    State(state): State<AppState>,
    Query(params): Query<CheckoutParams>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let user_id = params.user_id.as_deref().unwrap_or_default();
    let item_id = params.id.as_deref().unwrap_or_default();

    let code = state.checkout.checkout(user_id, item_id).await?;
    Ok(Json(CheckoutResponse {
        success: true,
        checkout_code: code,
        message: "Checkout session created. Redeem within the session TTL.".into(),
    }))
}
