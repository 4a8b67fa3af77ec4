//! In-memory store backend with the same uniqueness semantics as Postgres.
//!
//! Single-process only. Used by the test suites; the interesting concurrency
//! lives in the coordinator, so a mutex around plain maps is enough here.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{SaleStats, SaleStore, StoreError};
use crate::entity::{
    checkout::{self, CheckoutStatus},
    item, purchase,
    sale::{self, SaleStatus},
};

#[derive(Default)]
struct Inner {
    sales: HashMap<String, sale::Model>,
    /// window_start (unix millis) -> sale_id, the `sales(window_start)`
    /// unique index.
    window_index: HashMap<i64, String>,
    items: HashMap<(String, String), item::Model>,
    users: HashSet<String>,
    checkouts: HashMap<String, checkout::Model>,
    purchases: HashMap<String, purchase::Model>,
    /// (sale_id, item_id) pairs already sold, the `purchases(sale_id,
    /// item_id)` unique index.
    sold: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct MemorySaleStore {
    inner: Mutex<Inner>,
}

impl MemorySaleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: the number of purchase rows recorded for a sale.
    pub async fn purchase_count(&self, sale_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .purchases
            .values()
            .filter(|p| p.sale_id == sale_id)
            .count()
    }

    /// Test support: purchase rows for a (sale, user) pair.
    pub async fn purchases_by_user(&self, sale_id: &str, user_id: &str) -> Vec<purchase::Model> {
        let inner = self.inner.lock().await;
        inner
            .purchases
            .values()
            .filter(|p| p.sale_id == sale_id && p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Test support: a checkout row by code.
    pub async fn checkout_row(&self, code: &str) -> Option<checkout::Model> {
        let inner = self.inner.lock().await;
        inner.checkouts.get(code).cloned()
    }

    /// Test support: the items of a sale, ordered by item_id.
    pub async fn items_for_sale(&self, sale_id: &str) -> Vec<item::Model> {
        let inner = self.inner.lock().await;
        let mut items: Vec<item::Model> = inner
            .items
            .values()
            .filter(|i| i.sale_id == sale_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        items
    }
}

#[async_trait]
impl SaleStore for MemorySaleStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_sale(&self, sale: sale::Model) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let window_key = sale.window_start.timestamp_millis();
        if inner.window_index.contains_key(&window_key) {
            return Err(StoreError::Conflict("sales_window_start_key".into()));
        }
        if inner.sales.contains_key(&sale.sale_id) {
            return Err(StoreError::Conflict("sales_pkey".into()));
        }
        inner.window_index.insert(window_key, sale.sale_id.clone());
        inner.sales.insert(sale.sale_id.clone(), sale);
        Ok(())
    }

    async fn create_items(&self, items: Vec<item::Model>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for it in &items {
            let key = (it.sale_id.clone(), it.item_id.clone());
            if inner.items.contains_key(&key) {
                return Err(StoreError::Conflict("items_pkey".into()));
            }
        }
        for it in items {
            inner
                .items
                .insert((it.sale_id.clone(), it.item_id.clone()), it);
        }
        Ok(())
    }

    async fn get_sale(&self, sale_id: &str) -> Result<sale::Model, StoreError> {
        let inner = self.inner.lock().await;
        inner.sales.get(sale_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_active_sale(&self, now: DateTime<Utc>) -> Result<sale::Model, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .sales
            .values()
            .find(|s| {
                s.status == SaleStatus::Active && s.window_start <= now && s.window_end > now
            })
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_sale_by_window_start(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<sale::Model, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .window_index
            .get(&window_start.timestamp_millis())
            .and_then(|id| inner.sales.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn activate_sale(&self, sale_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(sale) = inner.sales.get_mut(sale_id) {
            if sale.status == SaleStatus::Scheduled {
                sale.status = SaleStatus::Active;
            }
        }
        Ok(())
    }

    async fn mark_sale_completed(&self, sale_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(sale) = inner.sales.get_mut(sale_id) {
            if sale.status == SaleStatus::Active {
                sale.status = SaleStatus::Completed;
            }
        }
        Ok(())
    }

    async fn mark_sale_cancelled(&self, sale_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(sale) = inner.sales.get_mut(sale_id) {
            sale.status = SaleStatus::Cancelled;
            // Mirrors the partial unique index: a cancelled sale releases
            // its window claim.
            let window_key = sale.window_start.timestamp_millis();
            inner.window_index.remove(&window_key);
        }
        Ok(())
    }

    async fn item_exists(&self, sale_id: &str, item_id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .contains_key(&(sale_id.to_string(), item_id.to_string())))
    }

    async fn ensure_user(&self, user_id: &str, _now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user_id.to_string());
        Ok(())
    }

    async fn insert_checkout(&self, row: checkout::Model) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.checkouts.contains_key(&row.code) {
            return Err(StoreError::Conflict("checkouts_pkey".into()));
        }
        inner.checkouts.insert(row.code.clone(), row);
        Ok(())
    }

    async fn mark_checkout_redeemed(&self, code: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.checkouts.get_mut(code) {
            if row.status == CheckoutStatus::Pending {
                row.status = CheckoutStatus::Redeemed;
            }
        }
        Ok(())
    }

    async fn expire_stale_checkouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut touched = 0;
        for row in inner.checkouts.values_mut() {
            if row.status == CheckoutStatus::Pending && row.expires_at <= now {
                row.status = CheckoutStatus::Expired;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn complete_finished_sales(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut completed = Vec::new();
        for sale in inner.sales.values_mut() {
            if sale.status == SaleStatus::Active && sale.window_end <= now {
                sale.status = SaleStatus::Completed;
                completed.push(sale.sale_id.clone());
            }
        }
        Ok(completed)
    }

    async fn insert_purchase(&self, row: purchase::Model) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let sold_key = (row.sale_id.clone(), row.item_id.clone());
        if inner.sold.contains(&sold_key) {
            return Err(StoreError::Conflict("purchases_sale_item_key".into()));
        }
        if inner.purchases.contains_key(&row.purchase_id) {
            return Err(StoreError::Conflict("purchases_pkey".into()));
        }
        inner.sold.insert(sold_key);
        inner.purchases.insert(row.purchase_id.clone(), row);
        Ok(())
    }

    async fn get_sale_stats(&self, sale_id: &str) -> Result<SaleStats, StoreError> {
        let inner = self.inner.lock().await;
        let sale = inner.sales.get(sale_id).ok_or(StoreError::NotFound)?;
        let sold = inner
            .purchases
            .values()
            .filter(|p| p.sale_id == sale_id)
            .count();
        Ok(SaleStats {
            total_items: sale.total_items,
            items_sold: sold as i64,
        })
    }
}
