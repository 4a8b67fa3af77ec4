//! Shared test doubles for the integration suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_api::entity::{checkout, item, purchase, sale};
use flashsale_api::store::{MemorySaleStore, SaleStats, SaleStore, StoreError};

/// Store wrapper that injects transient failures into selected operations,
/// delegating everything else to the in-memory store.
pub struct FlakyStore {
    pub inner: Arc<MemorySaleStore>,
    fail_insert_purchase: AtomicU32,
    fail_create_items: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemorySaleStore>) -> Self {
        Self {
            inner,
            fail_insert_purchase: AtomicU32::new(0),
            fail_create_items: AtomicU32::new(0),
        }
    }

    pub fn fail_next_purchase_inserts(&self, n: u32) {
        self.fail_insert_purchase.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_item_creates(&self, n: u32) {
        self.fail_create_items.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SaleStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn create_sale(&self, sale: sale::Model) -> Result<(), StoreError> {
        self.inner.create_sale(sale).await
    }

    async fn create_items(&self, items: Vec<item::Model>) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_create_items) {
            return Err(StoreError::Database("injected item insert failure".into()));
        }
        self.inner.create_items(items).await
    }

    async fn get_sale(&self, sale_id: &str) -> Result<sale::Model, StoreError> {
        self.inner.get_sale(sale_id).await
    }

    async fn get_active_sale(&self, now: DateTime<Utc>) -> Result<sale::Model, StoreError> {
        self.inner.get_active_sale(now).await
    }

    async fn find_sale_by_window_start(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<sale::Model, StoreError> {
        self.inner.find_sale_by_window_start(window_start).await
    }

    async fn activate_sale(&self, sale_id: &str) -> Result<(), StoreError> {
        self.inner.activate_sale(sale_id).await
    }

    async fn mark_sale_completed(&self, sale_id: &str) -> Result<(), StoreError> {
        self.inner.mark_sale_completed(sale_id).await
    }

    async fn mark_sale_cancelled(&self, sale_id: &str) -> Result<(), StoreError> {
        self.inner.mark_sale_cancelled(sale_id).await
    }

    async fn item_exists(&self, sale_id: &str, item_id: &str) -> Result<bool, StoreError> {
        self.inner.item_exists(sale_id, item_id).await
    }

    async fn ensure_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.ensure_user(user_id, now).await
    }

    async fn insert_checkout(&self, row: checkout::Model) -> Result<(), StoreError> {
        self.inner.insert_checkout(row).await
    }

    async fn mark_checkout_redeemed(&self, code: &str) -> Result<(), StoreError> {
        self.inner.mark_checkout_redeemed(code).await
    }

    async fn expire_stale_checkouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.expire_stale_checkouts(now).await
    }

    async fn complete_finished_sales(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.complete_finished_sales(now).await
    }

    async fn insert_purchase(&self, row: purchase::Model) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_insert_purchase) {
            return Err(StoreError::Connection("injected purchase insert failure".into()));
        }
        self.inner.insert_purchase(row).await
    }

    async fn get_sale_stats(&self, sale_id: &str) -> Result<SaleStats, StoreError> {
        self.inner.get_sale_stats(sale_id).await
    }
}
