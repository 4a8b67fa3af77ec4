//! Scheduler lifecycle: idempotent creation, adoption, sweeping and the
//! cancelled-partial-sale path.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flashsale_api::coordinator::{Coordinator, MemoryCoordinator};
use flashsale_api::entity::checkout::{self, CheckoutStatus};
use flashsale_api::entity::sale::{self, SaleStatus};
use flashsale_api::scheduler::{window_bounds, Scheduler};
use flashsale_api::store::{MemorySaleStore, SaleStore};
use support::FlakyStore;

const WINDOW: Duration = Duration::from_secs(3600);

fn backends() -> (Arc<MemorySaleStore>, Arc<MemoryCoordinator>) {
    (Arc::new(MemorySaleStore::new()), Arc::new(MemoryCoordinator::new()))
}

#[tokio::test]
async fn test_creation_materialises_quota_and_coordinator_state() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 25, WINDOW);

    let sale = scheduler.ensure_current_sale().await.expect("sale");

    let (expected_start, expected_end) = window_bounds(Utc::now(), WINDOW);
    assert_eq!(sale.window_start, expected_start);
    assert_eq!(sale.window_end, expected_end);
    assert_eq!(sale.status, SaleStatus::Active);
    assert_eq!(sale.total_items, 25);

    let items = store.items_for_sale(&sale.sale_id).await;
    assert_eq!(items.len(), 25);

    assert_eq!(coordinator.inventory(&sale.sale_id).await.unwrap(), Some(25));
    assert!(coordinator.sale_active(&sale.sale_id).await.unwrap());
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 5, WINDOW);

    let first = scheduler.ensure_current_sale().await.expect("first");
    let second = scheduler.ensure_current_sale().await.expect("second");
    assert_eq!(first.sale_id, second.sale_id);
    assert_eq!(store.items_for_sale(&first.sale_id).await.len(), 5);
    assert_eq!(coordinator.inventory(&first.sale_id).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_concurrent_creation_produces_one_sale() {
    let (store, coordinator) = backends();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store: Arc<dyn SaleStore> = store.clone();
        let coordinator: Arc<dyn Coordinator> = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let scheduler = Scheduler::new(store, coordinator, 5, WINDOW);
            scheduler.ensure_current_sale().await
        }));
    }

    let mut sale_ids = Vec::new();
    for handle in handles {
        sale_ids.push(handle.await.unwrap().expect("ensure").sale_id);
    }
    sale_ids.dedup();
    assert_eq!(sale_ids.len(), 1, "all schedulers converge on one sale");
    assert_eq!(store.items_for_sale(&sale_ids[0]).await.len(), 5);
}

#[tokio::test]
async fn test_sweep_stages_next_window_sale() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 4, WINDOW);
    let current = scheduler.ensure_current_sale().await.expect("sale");

    scheduler.sweep(Utc::now()).await.expect("sweep");

    let staged = store
        .find_sale_by_window_start(current.window_end)
        .await
        .expect("staged sale");
    assert_eq!(staged.status, SaleStatus::Scheduled);
    assert_eq!(staged.window_start, current.window_end);
    assert_eq!(store.items_for_sale(&staged.sale_id).await.len(), 4);

    // Coordinator state starts at activation, not at staging.
    assert_eq!(coordinator.inventory(&staged.sale_id).await.unwrap(), None);
    assert!(!coordinator.sale_active(&staged.sale_id).await.unwrap());

    // Staging is idempotent across sweeps.
    scheduler.sweep(Utc::now()).await.expect("second sweep");
    let again = store
        .find_sale_by_window_start(current.window_end)
        .await
        .expect("staged sale persists");
    assert_eq!(again.sale_id, staged.sale_id);
}

#[tokio::test]
async fn test_staged_sale_is_activated_at_its_window() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 3, WINDOW);

    // A sale staged for the current window by a previous sweep.
    let (window_start, window_end) = window_bounds(Utc::now(), WINDOW);
    let now = Utc::now();
    let staged = sale::Model {
        sale_id: "sale_staged".into(),
        window_start,
        window_end,
        total_items: 3,
        status: SaleStatus::Scheduled,
        created_at: now - Duration::from_secs(3600),
    };
    store.create_sale(staged).await.unwrap();

    let sale = scheduler.ensure_current_sale().await.expect("activation");
    assert_eq!(sale.sale_id, "sale_staged");
    assert_eq!(sale.status, SaleStatus::Active);
    assert_eq!(
        store.get_sale("sale_staged").await.unwrap().status,
        SaleStatus::Active
    );
    assert_eq!(coordinator.inventory("sale_staged").await.unwrap(), Some(3));
    assert!(coordinator.sale_active("sale_staged").await.unwrap());

    // Re-alignment adopts the now-active sale instead of creating another.
    let again = scheduler.ensure_current_sale().await.expect("adoption");
    assert_eq!(again.sale_id, "sale_staged");
}

#[tokio::test]
async fn test_mark_sale_completed_is_idempotent_and_final() {
    let (store, _) = backends();
    let now = Utc::now();
    let (window_start, window_end) = window_bounds(now, WINDOW);
    store
        .create_sale(sale::Model {
            sale_id: "sale_x".into(),
            window_start,
            window_end,
            total_items: 3,
            status: SaleStatus::Active,
            created_at: now,
        })
        .await
        .unwrap();

    store.mark_sale_completed("sale_x").await.unwrap();
    assert_eq!(
        store.get_sale("sale_x").await.unwrap().status,
        SaleStatus::Completed
    );

    store.mark_sale_completed("sale_x").await.unwrap();
    assert_eq!(
        store.get_sale("sale_x").await.unwrap().status,
        SaleStatus::Completed
    );

    // Unknown ids are a no-op, not an error.
    store.mark_sale_completed("sale_missing").await.unwrap();
}

#[tokio::test]
async fn test_sweep_expires_stale_checkouts() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 3, WINDOW);
    let sale = scheduler.ensure_current_sale().await.expect("sale");

    let now = Utc::now();
    let stale = checkout::Model {
        code: "chk_stale".into(),
        user_id: "u1".into(),
        item_id: "item_x".into(),
        sale_id: sale.sale_id.clone(),
        status: CheckoutStatus::Pending,
        created_at: now - Duration::from_secs(1800),
        expires_at: now - Duration::from_secs(900),
    };
    let fresh = checkout::Model {
        code: "chk_fresh".into(),
        expires_at: now + Duration::from_secs(900),
        created_at: now,
        ..stale.clone()
    };
    store.insert_checkout(stale).await.unwrap();
    store.insert_checkout(fresh).await.unwrap();

    scheduler.sweep(now).await.expect("sweep");

    assert_eq!(
        store.checkout_row("chk_stale").await.unwrap().status,
        CheckoutStatus::Expired
    );
    assert_eq!(
        store.checkout_row("chk_fresh").await.unwrap().status,
        CheckoutStatus::Pending
    );
}

#[tokio::test]
async fn test_sweep_completes_ended_sales_and_clears_flag() {
    let (store, coordinator) = backends();
    let scheduler = Scheduler::new(store.clone(), coordinator.clone(), 3, WINDOW);

    // A sale whose window ended an hour ago.
    let now = Utc::now();
    let old = sale::Model {
        sale_id: "sale_old".into(),
        window_start: now - Duration::from_secs(7200),
        window_end: now - Duration::from_secs(3600),
        total_items: 3,
        status: SaleStatus::Active,
        created_at: now - Duration::from_secs(7200),
    };
    store.create_sale(old).await.unwrap();
    coordinator.init_sale("sale_old", 3, WINDOW).await.unwrap();
    assert!(coordinator.sale_active("sale_old").await.unwrap());

    scheduler.sweep(now).await.expect("sweep");

    assert_eq!(
        store.get_sale("sale_old").await.unwrap().status,
        SaleStatus::Completed
    );
    assert!(!coordinator.sale_active("sale_old").await.unwrap());

    // Completion is idempotent across sweeps.
    scheduler.sweep(now).await.expect("second sweep");
    assert_eq!(
        store.get_sale("sale_old").await.unwrap().status,
        SaleStatus::Completed
    );
}

#[tokio::test]
async fn test_partial_sale_is_cancelled_and_window_recovers() {
    let (memory, coordinator) = backends();
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let dyn_store: Arc<dyn SaleStore> = flaky.clone();
    let scheduler = Scheduler::new(dyn_store, coordinator.clone(), 3, WINDOW);

    // Item materialisation fails: the partial sale must be cancelled, not
    // silently retried.
    flaky.fail_next_item_creates(1);
    scheduler
        .ensure_current_sale()
        .await
        .expect_err("initialisation must fail");

    // The next alignment starts fresh with a new sale_id in the same window.
    let sale = scheduler.ensure_current_sale().await.expect("recovery");
    assert_eq!(sale.status, SaleStatus::Active);
    assert_eq!(memory.items_for_sale(&sale.sale_id).await.len(), 3);

    // The cancelled partial sale is still on record.
    let (window_start, _) = window_bounds(Utc::now(), WINDOW);
    assert_eq!(sale.window_start, window_start);
}
