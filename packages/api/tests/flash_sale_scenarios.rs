//! End-to-end scenarios against the in-memory store and coordinator.
//!
//! Small quotas and caps (Q=3, C=2 unless stated) keep the lifecycles
//! observable; the invariants under test are the same ones production runs
//! with.

use std::sync::Arc;
use std::time::Duration;

use flashsale_api::checkout::CheckoutService;
use flashsale_api::coordinator::{Coordinator, MemoryCoordinator, SessionRecord};
use flashsale_api::entity::checkout::CheckoutStatus;
use flashsale_api::entity::sale::{self, SaleStatus};
use flashsale_api::error::ApiError;
use flashsale_api::purchase::PurchaseService;
use flashsale_api::scheduler::Scheduler;
use flashsale_api::store::{MemorySaleStore, SaleStore};

const SESSION_TTL: Duration = Duration::from_secs(60);
const COUNTER_TTL: Duration = Duration::from_secs(3600);

struct Harness {
    store: Arc<MemorySaleStore>,
    coordinator: Arc<MemoryCoordinator>,
    checkout: CheckoutService,
    purchase: PurchaseService,
    scheduler: Scheduler,
    sale: sale::Model,
    items: Vec<String>,
}

async fn harness(quota: i64, user_limit: i64) -> Harness {
    harness_with(quota, user_limit, SESSION_TTL, Duration::from_secs(3600)).await
}

async fn harness_with(
    quota: i64,
    user_limit: i64,
    session_ttl: Duration,
    window: Duration,
) -> Harness {
    let store = Arc::new(MemorySaleStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let dyn_store: Arc<dyn SaleStore> = store.clone();
    let dyn_coordinator: Arc<dyn Coordinator> = coordinator.clone();

    let scheduler = Scheduler::new(dyn_store.clone(), dyn_coordinator.clone(), quota, window);
    let sale = scheduler
        .ensure_current_sale()
        .await
        .expect("sale creation");
    let items = store
        .items_for_sale(&sale.sale_id)
        .await
        .into_iter()
        .map(|i| i.item_id)
        .collect();

    let checkout = CheckoutService::new(
        dyn_store.clone(),
        dyn_coordinator.clone(),
        user_limit,
        session_ttl,
    );
    let purchase = PurchaseService::new(dyn_store, dyn_coordinator, user_limit, COUNTER_TTL);

    Harness {
        store,
        coordinator,
        checkout,
        purchase,
        scheduler,
        sale,
        items,
    }
}

#[tokio::test]
async fn test_happy_path_two_users() {
    let h = harness(3, 2).await;
    let (i1, i2) = (h.items[0].clone(), h.items[1].clone());

    let k1 = h.checkout.checkout("u1", &i1).await.expect("checkout u1");
    let p1 = h.purchase.purchase(&k1).await.expect("purchase u1");
    assert!(p1.starts_with("pur_"));

    let k2 = h.checkout.checkout("u2", &i2).await.expect("checkout u2");
    h.purchase.purchase(&k2).await.expect("purchase u2");

    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(1));
    assert_eq!(h.store.purchase_count(&h.sale.sale_id).await, 2);
    assert_eq!(h.store.purchases_by_user(&h.sale.sale_id, "u1").await.len(), 1);
    assert_eq!(
        h.store.purchases_by_user(&h.sale.sale_id, "u1").await[0].item_id,
        i1
    );

    // The redeemed code's durable mirror is terminal.
    let row = h.store.checkout_row(&k1).await.expect("checkout row");
    assert_eq!(row.status, CheckoutStatus::Redeemed);

    let stats = h.store.get_sale_stats(&h.sale.sale_id).await.unwrap();
    assert_eq!(stats.total_items, 3);
    assert_eq!(stats.items_sold, 2);
}

#[tokio::test]
async fn test_sold_out_after_quota() {
    let h = harness(3, 10).await;

    // Sell all three items to distinct users.
    for (n, item) in h.items.iter().enumerate() {
        let user = format!("u{n}");
        let code = h.checkout.checkout(&user, item).await.expect("checkout");
        h.purchase.purchase(&code).await.expect("purchase");
    }
    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(0));

    // A late holder of a valid session hits SoldOut; nothing mutates.
    let record = SessionRecord {
        user_id: "late".into(),
        item_id: h.items[0].clone(),
        sale_id: h.sale.sale_id.clone(),
        created_at: 0,
    };
    h.coordinator
        .put_session("chk_late", &record, SESSION_TTL)
        .await
        .unwrap();
    let err = h.purchase.purchase("chk_late").await.unwrap_err();
    assert!(matches!(err, ApiError::SoldOut));
    assert_eq!(h.store.purchase_count(&h.sale.sale_id).await, 3);
}

#[tokio::test]
async fn test_sellout_completes_sale_early() {
    let h = harness(2, 5).await;

    for (n, item) in h.items.iter().enumerate() {
        let user = format!("u{n}");
        let code = h.checkout.checkout(&user, item).await.expect("checkout");
        h.purchase.purchase(&code).await.expect("purchase");
    }

    // The quota sold out well before window_end: the sale retires
    // immediately instead of idling as active until the sweep.
    let sale = h.store.get_sale(&h.sale.sale_id).await.unwrap();
    assert_eq!(sale.status, SaleStatus::Completed);
    assert!(!h.coordinator.sale_active(&h.sale.sale_id).await.unwrap());
    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(0));

    // New checkouts see no active sale.
    let err = h.checkout.checkout("u9", &h.items[0]).await.unwrap_err();
    assert!(matches!(err, ApiError::SaleInactive));
}

#[tokio::test]
async fn test_user_cap_at_checkout_and_at_purchase() {
    let h = harness(3, 2).await;

    for item in h.items.iter().take(2) {
        let code = h.checkout.checkout("u1", item).await.expect("checkout");
        h.purchase.purchase(&code).await.expect("purchase");
    }

    // Advisory check at checkout.
    let err = h.checkout.checkout("u1", &h.items[2]).await.unwrap_err();
    assert!(matches!(err, ApiError::UserLimitExceeded));

    // Smuggled past the checkout pre-check: the binding check in the
    // compound step still rejects, without consuming inventory.
    let record = SessionRecord {
        user_id: "u1".into(),
        item_id: h.items[2].clone(),
        sale_id: h.sale.sale_id.clone(),
        created_at: 0,
    };
    h.coordinator
        .put_session("chk_smuggled", &record, SESSION_TTL)
        .await
        .unwrap();
    let err = h.purchase.purchase("chk_smuggled").await.unwrap_err();
    assert!(matches!(err, ApiError::UserLimitExceeded));
    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(1));
    assert_eq!(h.store.purchases_by_user(&h.sale.sale_id, "u1").await.len(), 2);
}

#[tokio::test]
async fn test_session_expiry_yields_invalid_code() {
    let h = harness_with(3, 2, Duration::from_millis(50), Duration::from_secs(3600)).await;

    let code = h.checkout.checkout("u1", &h.items[0]).await.expect("checkout");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let err = h.purchase.purchase(&code).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidOrExpiredCode));
    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(3));
    assert_eq!(h.store.purchase_count(&h.sale.sale_id).await, 0);
}

#[tokio::test]
async fn test_concurrent_redemption_of_same_code() {
    // Repeat to give the race a fair chance of genuine interleaving.
    for _ in 0..20 {
        let h = harness(3, 2).await;
        let code = h.checkout.checkout("u1", &h.items[0]).await.expect("checkout");
        let purchase = Arc::new(h.purchase);

        let a = {
            let purchase = purchase.clone();
            let code = code.clone();
            tokio::spawn(async move { purchase.purchase(&code).await })
        };
        let b = {
            let purchase = purchase.clone();
            let code = code.clone();
            tokio::spawn(async move { purchase.purchase(&code).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one redemption must win");
        let loser = results
            .iter()
            .find_map(|r| r.as_ref().err())
            .expect("one redemption must lose");
        assert!(matches!(loser, ApiError::InvalidOrExpiredCode));
        assert_eq!(h.store.purchase_count(&h.sale.sale_id).await, 1);
        assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(2));
    }
}

#[tokio::test]
async fn test_invalid_code_is_bad_request_taxonomy() {
    let h = harness(3, 2).await;
    let err = h.purchase.purchase("chk_never_issued").await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidOrExpiredCode));

    let err = h.purchase.purchase("").await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_checkout_rejects_unknown_item_and_bad_input() {
    let h = harness(3, 2).await;

    let err = h.checkout.checkout("u1", "item_not_in_sale").await.unwrap_err();
    assert!(matches!(err, ApiError::UnknownItem));

    let err = h.checkout.checkout("", &h.items[0]).await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let long = "x".repeat(65);
    let err = h.checkout.checkout(&long, &h.items[0]).await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_checkout_without_active_sale() {
    let store: Arc<dyn SaleStore> = Arc::new(MemorySaleStore::new());
    let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
    let checkout = CheckoutService::new(store, coordinator, 10, SESSION_TTL);

    let err = checkout.checkout("u1", "item_x").await.unwrap_err();
    assert!(matches!(err, ApiError::SaleInactive));
}

#[tokio::test]
async fn test_rollover_old_code_resolves_against_old_sale() {
    // One-second windows so a real rollover happens mid-test. Align to just
    // past a boundary so the first checkout cannot straddle one.
    let into_window = chrono::Utc::now().timestamp_subsec_millis() as u64 % 1000;
    tokio::time::sleep(Duration::from_millis(1100 - into_window)).await;
    let h = harness_with(3, 5, Duration::from_secs(60), Duration::from_secs(1)).await;
    let s1 = h.sale.sale_id.clone();

    let old_code = h.checkout.checkout("u1", &h.items[0]).await.expect("checkout in s1");

    // Cross the boundary and roll the sale over.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let s2 = h
        .scheduler
        .ensure_current_sale()
        .await
        .expect("rollover sale")
        .sale_id;
    h.scheduler.sweep(chrono::Utc::now()).await.expect("sweep");
    assert_ne!(s1, s2);

    // New checkouts reference the new sale.
    let s2_items = h.store.items_for_sale(&s2).await;
    let new_code = h
        .checkout
        .checkout("u2", &s2_items[0].item_id)
        .await
        .expect("checkout in s2");
    assert_ne!(old_code, new_code);

    // The code issued under s1 is still within its TTL and resolves against
    // s1, never mixing sales.
    h.purchase.purchase(&old_code).await.expect("old code redeems");
    let purchases = h.store.purchases_by_user(&s1, "u1").await;
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].sale_id, s1);
}

#[tokio::test]
async fn test_no_oversell_under_concurrent_storm() {
    // N >> Q: forty contenders for ten slots.
    let h = harness(10, 100).await;
    let purchase = Arc::new(h.purchase);

    let mut codes = Vec::new();
    for n in 0..40 {
        let user = format!("u{n}");
        let item = &h.items[n % h.items.len()];
        match h.checkout.checkout(&user, item).await {
            Ok(code) => codes.push(code),
            Err(e) => panic!("checkout should not fail before any purchase: {e}"),
        }
    }

    let mut handles = Vec::new();
    for code in codes {
        let purchase = purchase.clone();
        handles.push(tokio::spawn(async move { purchase.purchase(&code).await }));
    }

    let mut successes = 0usize;
    let mut sold_out = 0usize;
    let mut conflicts = 0usize;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(ApiError::SoldOut) => sold_out += 1,
            Err(ApiError::Conflict) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // Every request resolved one way.
    assert_eq!(successes + sold_out + conflicts, 40);
    // No oversell: never more durable purchases than the quota, and every
    // success is backed by a row.
    assert!(successes >= 1 && successes <= 10);
    assert_eq!(h.store.purchase_count(&h.sale.sale_id).await, successes);
    // Each redemption that got past the compound step consumed exactly one
    // slot, whether it landed durably or died on the (sale, item) uniqueness
    // guard; with 40 contenders for 10 slots the counter must bottom out.
    assert_eq!(successes + conflicts, 10);
    assert_eq!(h.coordinator.inventory(&h.sale.sale_id).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_user_cap_under_concurrent_storm() {
    // One user holds six codes for six distinct items with C=3.
    let h = harness(6, 3).await;
    let purchase = Arc::new(h.purchase);

    let mut codes = Vec::new();
    for item in &h.items {
        codes.push(h.checkout.checkout("greedy", item).await.expect("checkout"));
    }

    let mut handles = Vec::new();
    for code in codes {
        let purchase = purchase.clone();
        handles.push(tokio::spawn(async move { purchase.purchase(&code).await }));
    }

    let mut successes = 0;
    let mut capped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(ApiError::UserLimitExceeded) => capped += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 3);
    assert_eq!(capped, 3);
    assert_eq!(h.store.purchases_by_user(&h.sale.sale_id, "greedy").await.len(), 3);
    assert_eq!(h.coordinator.user_count(&h.sale.sale_id, "greedy").await.unwrap(), 3);
}
