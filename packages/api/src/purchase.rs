//! Purchase service: atomic redemption of checkout codes.
//!
//! The coordinator's compound step makes the decision; this service then
//! binds it to durable truth. The single subtle part is the window between
//! the two planes: once the compound step has consumed inventory, the
//! durable insert must eventually happen. Uniqueness constraints make the
//! insert safe to retry, and exhausted retries land in the reconciliation
//! log instead of silently unwinding a consumed slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::coordinator::{Coordinator, RedeemOutcome};
use crate::entity::purchase;
use crate::error::ApiError;
use crate::store::{SaleStore, StoreError};

/// Maximum durable-insert attempts (R in the redemption protocol).
const MAX_INSERT_ATTEMPTS: u32 = 5;
/// First backoff; doubles per attempt.
const INSERT_BACKOFF_BASE: Duration = Duration::from_millis(50);

pub struct PurchaseService {
    store: Arc<dyn SaleStore>,
    coordinator: Arc<dyn Coordinator>,
    user_limit: i64,
    /// TTL applied to the per-(sale, user) counter on each increment; at
    /// least the sale window plus margin.
    counter_ttl: Duration,
}

impl PurchaseService {
    pub fn new(
        store: Arc<dyn SaleStore>,
        coordinator: Arc<dyn Coordinator>,
        user_limit: i64,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            user_limit,
            counter_ttl,
        }
    }

    /// Redeems a checkout code and returns the purchase id.
    pub async fn purchase(&self, code: &str) -> Result<String, ApiError> {
        if code.is_empty() {
            return Err(ApiError::BadRequest(
                "missing required parameter: code".into(),
            ));
        }

        // Never retried transparently: if the step's outcome is ambiguous
        // (submitted, reply lost), the code is flagged for verification and
        // a reconciler resolves it from the session key's absence and the
        // counter deltas.
        let outcome = match self
            .coordinator
            .redeem(code, self.user_limit, self.counter_ttl)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    target: "reconciliation",
                    code_prefix = code.get(..8).unwrap_or(code),
                    error = %e,
                    "redemption outcome ambiguous; code pending verification"
                );
                return Err(e.into());
            }
        };

        let (sale_id, user_id, item_id, remaining) = match outcome {
            RedeemOutcome::Redeemed {
                sale_id,
                user_id,
                item_id,
                remaining,
            } => (sale_id, user_id, item_id, remaining),
            RedeemOutcome::InvalidCode => return Err(ApiError::InvalidOrExpiredCode),
            RedeemOutcome::UserLimitExceeded => return Err(ApiError::UserLimitExceeded),
            RedeemOutcome::SoldOut => return Err(ApiError::SoldOut),
        };

        // Inventory is consumed from here on; every path below must either
        // persist the purchase or leave a durable trail for the reconciler.
        let purchase_id = format!("pur_{}", Uuid::new_v4().simple());
        let row = purchase::Model {
            purchase_id: purchase_id.clone(),
            user_id: user_id.clone(),
            item_id: item_id.clone(),
            sale_id: sale_id.clone(),
            checkout_code: code.to_string(),
            created_at: Utc::now(),
        };
        self.persist(row).await?;

        if let Err(e) = self.store.mark_checkout_redeemed(code).await {
            tracing::warn!(error = %e, "failed to mark checkout row redeemed");
        }

        if remaining == 0 {
            self.retire_sold_out_sale(&sale_id).await;
        }

        tracing::info!(
            purchase_id = %purchase_id,
            sale_id = %sale_id,
            user_id = %user_id,
            item_id = %item_id,
            "purchase completed"
        );
        Ok(purchase_id)
    }

    /// This redemption took the last inventory slot. When the durable rows
    /// confirm the quota is fully sold, complete the sale ahead of its
    /// window end. When they do not (conflict-consumed slots awaiting the
    /// reconciler), leave it to the window-end sweep. Best effort either
    /// way; the sweep is the backstop.
    async fn retire_sold_out_sale(&self, sale_id: &str) {
        let stats = match self.store.get_sale_stats(sale_id).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(sale_id = %sale_id, error = %e, "sold-out check failed");
                return;
            }
        };
        if stats.items_sold < stats.total_items {
            return;
        }
        if let Err(e) = self.store.mark_sale_completed(sale_id).await {
            tracing::warn!(sale_id = %sale_id, error = %e, "failed to complete sold-out sale");
            return;
        }
        if let Err(e) = self.coordinator.clear_sale(sale_id).await {
            tracing::warn!(sale_id = %sale_id, error = %e, "failed to clear sold-out sale flag");
        }
        tracing::info!(sale_id = %sale_id, "sale sold out; completed early");
    }

    async fn persist(&self, row: purchase::Model) -> Result<(), ApiError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.insert_purchase(row.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(constraint)) => {
                    // A double redemption escaped the compound step. The
                    // inventory decrement stands; durable uniqueness keeps
                    // the item single-sold. Audit and surface the conflict.
                    tracing::error!(
                        target: "audit",
                        sale_id = %row.sale_id,
                        item_id = %row.item_id,
                        user_id = %row.user_id,
                        constraint = %constraint,
                        "duplicate purchase rejected by durable store"
                    );
                    return Err(ApiError::Conflict);
                }
                Err(e) if e.is_transient() && attempt < MAX_INSERT_ATTEMPTS => {
                    let backoff = INSERT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "purchase insert failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    // The in-memory decrement stands; record everything a
                    // reconciler needs to back-fill the row.
                    tracing::error!(
                        target: "reconciliation",
                        purchase_id = %row.purchase_id,
                        sale_id = %row.sale_id,
                        user_id = %row.user_id,
                        item_id = %row.item_id,
                        checkout_code = %row.checkout_code,
                        error = %e,
                        "purchase insert exhausted retries; awaiting back-fill"
                    );
                    return Err(ApiError::Transient);
                }
            }
        }
    }
}
