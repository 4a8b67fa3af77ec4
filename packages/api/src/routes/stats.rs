use axum::extract::State;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;
use crate::store::StoreError;

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct StatsResponse {
    pub success: bool,
    pub sale_id: String,
    pub window_start: chrono::DateTime<Utc>,
    pub window_end: chrono::DateTime<Utc>,
    pub total_items: i64,
    pub items_sold: i64,
    /// Live coordinator counter; `None` when the key has lapsed.
    pub current_inventory: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "sale",
    responses(
        (status = 200, description = "Current sale statistics", body = StatsResponse),
        (status = 409, description = "No active sale"),
        (status = 503, description = "Store or coordinator unavailable"),
    )
)]
#[tracing::instrument(name = "GET /stats", skip(state))]
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let sale = match state.store.get_active_sale(Utc::now()).await {
        Ok(sale) => sale,
        Err(StoreError::NotFound) => return Err(ApiError::SaleInactive),
        Err(other) => return Err(other.into()),
    };
    let stats = state.store.get_sale_stats(&sale.sale_id).await?;
    let current_inventory = state.coordinator.inventory(&sale.sale_id).await?;

    Ok(Json(StatsResponse {
        success: true,
        sale_id: sale.sale_id,
        window_start: sale.window_start,
        window_end: sale.window_end,
        total_items: stats.total_items,
        items_sold: stats.items_sold,
        current_inventory,
    }))
}
