//! Checkout service: validates preconditions and mints checkout sessions.
//!
//! Checkout does NOT reserve inventory. Reservation happens exactly once, in
//! the purchase path's compound step; the user-cap check here is advisory
//! only and exists to fail obviously-doomed requests early.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::coordinator::{Coordinator, SessionRecord};
use crate::entity::checkout::{self, CheckoutStatus};
use crate::entity::sale;
use crate::error::ApiError;
use crate::store::{SaleStore, StoreError};

/// Upper bound for user_id and item_id inputs.
const MAX_ID_LEN: usize = 64;

/// How long a cached active-sale row may be served. Short, so a rollover is
/// observed promptly.
const ACTIVE_SALE_CACHE_TTL: Duration = Duration::from_secs(2);

/// Item membership is immutable for the lifetime of a sale, so this can be
/// generous.
const ITEM_CACHE_TTL: Duration = Duration::from_secs(60);
const ITEM_CACHE_CAPACITY: u64 = 100_000;

pub struct CheckoutService {
    store: Arc<dyn SaleStore>,
    coordinator: Arc<dyn Coordinator>,
    user_limit: i64,
    session_ttl: Duration,
    active_sale_cache: moka::sync::Cache<&'static str, sale::Model>,
    item_cache: moka::sync::Cache<String, ()>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn SaleStore>,
        coordinator: Arc<dyn Coordinator>,
        user_limit: i64,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            user_limit,
            session_ttl,
            active_sale_cache: moka::sync::Cache::builder()
                .max_capacity(4)
                .time_to_live(ACTIVE_SALE_CACHE_TTL)
                .build(),
            item_cache: moka::sync::Cache::builder()
                .max_capacity(ITEM_CACHE_CAPACITY)
                .time_to_live(ITEM_CACHE_TTL)
                .build(),
        }
    }

    /// Creates a checkout session for (user, item) against the active sale
    /// and returns the checkout code.
    pub async fn checkout(&self, user_id: &str, item_id: &str) -> Result<String, ApiError> {
        validate_id("user_id", user_id)?;
        validate_id("id", item_id)?;

        let mut sale = self.active_sale().await?;

        if !self.coordinator.sale_active(&sale.sale_id).await? {
            // The cached row may be one rollover behind the coordinator;
            // re-resolve once before rejecting.
            self.active_sale_cache.invalidate("active");
            sale = self.active_sale().await?;
            if !self.coordinator.sale_active(&sale.sale_id).await? {
                return Err(ApiError::SaleInactive);
            }
        }

        if !self.item_in_sale(&sale.sale_id, item_id).await? {
            return Err(ApiError::UnknownItem);
        }

        // Advisory pre-check; the binding check runs inside the purchase
        // path's compound step.
        let count = self.coordinator.user_count(&sale.sale_id, user_id).await?;
        if count >= self.user_limit {
            return Err(ApiError::UserLimitExceeded);
        }

        let now = Utc::now();
        let code = self.mint_session(user_id, item_id, &sale.sale_id).await?;

        self.store.ensure_user(user_id, now).await?;
        let row = checkout::Model {
            code: code.clone(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            sale_id: sale.sale_id.clone(),
            status: CheckoutStatus::Pending,
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        match self.store.insert_checkout(row).await {
            Ok(()) => {}
            Err(StoreError::Conflict(constraint)) => {
                // The coordinator already accepted this code as absent, so a
                // durable duplicate means the planes disagree. Drop the
                // session rather than hand out a code with two owners.
                tracing::error!(
                    code_prefix = &code[..CODE_PREFIX_LEN],
                    constraint = %constraint,
                    "checkout code collided in durable store"
                );
                self.coordinator.delete_session(&code).await.ok();
                return Err(ApiError::Internal);
            }
            Err(other) => return Err(other.into()),
        }

        tracing::info!(
            user_id,
            item_id,
            sale_id = %sale.sale_id,
            code_prefix = &code[..CODE_PREFIX_LEN],
            "checkout session created"
        );
        Ok(code)
    }

    async fn active_sale(&self) -> Result<sale::Model, ApiError> {
        if let Some(sale) = self.active_sale_cache.get("active") {
            // Never serve a sale past its own window, however fresh the
            // cache entry.
            if sale.window_end > Utc::now() {
                return Ok(sale);
            }
            self.active_sale_cache.invalidate("active");
        }
        match self.store.get_active_sale(Utc::now()).await {
            Ok(sale) => {
                self.active_sale_cache.insert("active", sale.clone());
                Ok(sale)
            }
            Err(StoreError::NotFound) => Err(ApiError::SaleInactive),
            Err(other) => Err(other.into()),
        }
    }

    async fn item_in_sale(&self, sale_id: &str, item_id: &str) -> Result<bool, ApiError> {
        let key = format!("{sale_id}:{item_id}");
        if self.item_cache.get(&key).is_some() {
            return Ok(true);
        }
        let exists = self.store.item_exists(sale_id, item_id).await?;
        if exists {
            // Only positive results are cached; a miss is cheap and a sale's
            // item set never shrinks.
            self.item_cache.insert(key, ());
        }
        Ok(exists)
    }

    async fn mint_session(
        &self,
        user_id: &str,
        item_id: &str,
        sale_id: &str,
    ) -> Result<String, ApiError> {
        let record = SessionRecord {
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            sale_id: sale_id.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        // A 128-bit code never collides in practice; the bounded loop guards
        // against a broken entropy source rather than expected collisions.
        for _ in 0..3 {
            let code = mint_code();
            if self
                .coordinator
                .put_session(&code, &record, self.session_ttl)
                .await?
            {
                return Ok(code);
            }
        }
        tracing::error!("checkout code collided repeatedly in coordinator");
        Err(ApiError::Internal)
    }
}

const CODE_PREFIX_LEN: usize = 8;

/// Mints a URL-safe checkout code with 128 bits of CSPRNG entropy.
fn mint_code() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("chk_{hex}")
}

fn validate_id(field: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "missing required parameter: {field}"
        )));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "parameter too long: {field}"
        )));
    }
    Ok(())
}
