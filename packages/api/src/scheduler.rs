//! Sale lifecycle scheduler.
//!
//! One logical task per instance: aligns sales to window boundaries,
//! materialises the item quota, initialises coordinator counters and sweeps
//! expired state. Cross-instance safety comes from the durable uniqueness
//! constraint on `sales(window_start)`: whoever inserts first wins, the
//! loser adopts the winning row.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::entity::item;
use crate::entity::sale::{self, SaleStatus};
use crate::store::{SaleStore, StoreError};

/// Grace added to coordinator TTLs past the window end, so purchases issued
/// just before rollover can still settle.
const WINDOW_TTL_MARGIN: Duration = Duration::from_secs(300);

/// Floor of the sweep cadence (`W / 4` for realistic windows).
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// [window_start, window_end) for the window containing `now`.
pub fn window_bounds(now: DateTime<Utc>, window: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let w = window.as_secs().max(1) as i64;
    let start = now.timestamp() - now.timestamp().rem_euclid(w);
    let start = Utc.timestamp_opt(start, 0).unwrap();
    (start, start + window)
}

/// Coordinator TTL for a sale's keys: the full window plus margin.
pub fn sale_key_ttl(window: Duration) -> Duration {
    window + WINDOW_TTL_MARGIN
}

pub struct Scheduler {
    store: Arc<dyn SaleStore>,
    coordinator: Arc<dyn Coordinator>,
    quota: i64,
    window: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SaleStore>,
        coordinator: Arc<dyn Coordinator>,
        quota: i64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            quota,
            window,
        }
    }

    /// Scheduler loop: adopt or create the current sale, then wake on window
    /// boundaries and on the sweep cadence. Runs until the task is dropped.
    pub async fn run(&self) {
        if let Err(e) = self.ensure_current_sale().await {
            tracing::error!(error = %e, "initial sale alignment failed");
        }

        let sweep_every = (self.window / 4).max(MIN_SWEEP_INTERVAL);
        loop {
            let now = Utc::now();
            let (_, window_end) = window_bounds(now, self.window);
            let until_boundary = (window_end - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let sleep_for = until_boundary.min(sweep_every).max(Duration::from_millis(250));
            tokio::time::sleep(sleep_for).await;

            if let Err(e) = self.ensure_current_sale().await {
                tracing::error!(error = %e, "sale alignment failed");
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                tracing::error!(error = %e, "sweep failed");
            }
        }
    }

    /// Adopts the active sale for the current window, activating a
    /// pre-staged one or creating a fresh one when absent. Idempotent; safe
    /// under retry and concurrent schedulers.
    pub async fn ensure_current_sale(&self) -> Result<sale::Model, SchedulerError> {
        let now = Utc::now();
        let (window_start, _) = window_bounds(now, self.window);

        match self.store.get_active_sale(now).await {
            Ok(sale) => {
                // Heals a crash between the durable insert and the
                // coordinator init; set-if-absent makes this a no-op
                // otherwise.
                let freshly = self
                    .coordinator
                    .init_sale(&sale.sale_id, sale.total_items, sale_key_ttl(self.window))
                    .await?;
                if freshly {
                    tracing::warn!(sale_id = %sale.sale_id, "re-initialised coordinator state for adopted sale");
                }
                Ok(sale)
            }
            Err(StoreError::NotFound) => self.align_window(window_start).await,
            Err(other) => Err(other.into()),
        }
    }

    /// No sale is active for the current window: activate the pre-staged
    /// one, respect an early-completed one, or create from scratch.
    async fn align_window(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<sale::Model, SchedulerError> {
        match self.store.find_sale_by_window_start(window_start).await {
            Ok(sale) => match sale.status {
                SaleStatus::Scheduled => self.activate_sale(sale).await,
                SaleStatus::Active => {
                    // Another instance activated it between our two reads.
                    self.coordinator
                        .init_sale(&sale.sale_id, sale.total_items, sale_key_ttl(self.window))
                        .await?;
                    Ok(sale)
                }
                // Sold out before its window ended; stays retired, no
                // coordinator state is re-raised.
                SaleStatus::Completed => Ok(sale),
                SaleStatus::Cancelled => self.create_sale(window_start).await,
            },
            Err(StoreError::NotFound) => self.create_sale(window_start).await,
            Err(other) => Err(other.into()),
        }
    }

    /// scheduled -> active at the window boundary. Items were materialised
    /// when the sale was staged; only the coordinator state starts now.
    async fn activate_sale(&self, sale: sale::Model) -> Result<sale::Model, SchedulerError> {
        self.store.activate_sale(&sale.sale_id).await?;
        self.coordinator
            .init_sale(&sale.sale_id, sale.total_items, sale_key_ttl(self.window))
            .await?;
        tracing::info!(
            sale_id = %sale.sale_id,
            window_start = %sale.window_start,
            "activated staged sale"
        );
        Ok(sale::Model {
            status: SaleStatus::Active,
            ..sale
        })
    }

    async fn create_sale(&self, window_start: DateTime<Utc>) -> Result<sale::Model, SchedulerError> {
        let now = Utc::now();
        let sale_id = mint_sale_id(window_start);
        let sale = sale::Model {
            sale_id: sale_id.clone(),
            window_start,
            window_end: window_start + self.window,
            total_items: self.quota,
            status: SaleStatus::Active,
            created_at: now,
        };

        match self.store.create_sale(sale.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // Lost the creation race; adopt the winner.
                let winner = self.store.find_sale_by_window_start(window_start).await?;
                tracing::info!(sale_id = %winner.sale_id, "adopted sale created by another instance");
                self.coordinator
                    .init_sale(&winner.sale_id, winner.total_items, sale_key_ttl(self.window))
                    .await?;
                return Ok(winner);
            }
            Err(other) => return Err(other.into()),
        }

        // From here on a failure leaves a partial sale: cancel it and report.
        // The next alignment mints a fresh sale_id instead of retrying this
        // one.
        if let Err(e) = self.materialise(&sale).await {
            tracing::error!(
                sale_id = %sale_id,
                error = %e,
                "sale initialisation failed; cancelling partial sale"
            );
            if let Err(cancel_err) = self.store.mark_sale_cancelled(&sale_id).await {
                tracing::error!(sale_id = %sale_id, error = %cancel_err, "failed to cancel partial sale");
            }
            return Err(e);
        }

        tracing::info!(
            sale_id = %sale_id,
            window_start = %sale.window_start,
            window_end = %sale.window_end,
            total_items = self.quota,
            "sale created"
        );
        Ok(sale)
    }

    async fn materialise(&self, sale: &sale::Model) -> Result<(), SchedulerError> {
        let items = generate_items(&sale.sale_id, self.quota, sale.created_at);
        self.store.create_items(items).await?;
        self.coordinator
            .init_sale(&sale.sale_id, self.quota, sale_key_ttl(self.window))
            .await?;
        Ok(())
    }

    /// Cleanup cadence: retire expired checkout sessions the coordinator TTL
    /// already dropped, complete sales whose window has ended, and stage the
    /// next window's sale.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let expired = self.store.expire_stale_checkouts(now).await?;
        if expired > 0 {
            tracing::info!(expired, "expired stale checkout sessions");
        }

        let completed = self.store.complete_finished_sales(now).await?;
        for sale_id in &completed {
            self.coordinator.clear_sale(sale_id).await?;
            tracing::info!(sale_id = %sale_id, "sale completed");
        }

        self.stage_next_sale(now).await
    }

    /// Pre-creates the next window's sale in `scheduled` status with its
    /// items, so the boundary only has to flip the status and seed the
    /// coordinator. The uniqueness on window_start arbitrates concurrent
    /// stagers the same way it does creators.
    async fn stage_next_sale(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let (_, window_end) = window_bounds(now, self.window);
        let next_start = window_end;

        match self.store.find_sale_by_window_start(next_start).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NotFound) => {}
            Err(other) => return Err(other.into()),
        }

        let sale_id = mint_sale_id(next_start);
        let sale = sale::Model {
            sale_id: sale_id.clone(),
            window_start: next_start,
            window_end: next_start + self.window,
            total_items: self.quota,
            status: SaleStatus::Scheduled,
            created_at: now,
        };
        match self.store.create_sale(sale.clone()).await {
            Ok(()) => {}
            // Another instance staged it first.
            Err(StoreError::Conflict(_)) => return Ok(()),
            Err(other) => return Err(other.into()),
        }

        let items = generate_items(&sale_id, self.quota, sale.created_at);
        if let Err(e) = self.store.create_items(items).await {
            tracing::error!(
                sale_id = %sale_id,
                error = %e,
                "staging failed; cancelling partial sale"
            );
            if let Err(cancel_err) = self.store.mark_sale_cancelled(&sale_id).await {
                tracing::error!(sale_id = %sale_id, error = %cancel_err, "failed to cancel partial sale");
            }
            return Err(e.into());
        }

        tracing::info!(
            sale_id = %sale_id,
            window_start = %sale.window_start,
            total_items = self.quota,
            "staged next sale"
        );
        Ok(())
    }
}

fn mint_sale_id(window_start: DateTime<Utc>) -> String {
    let entropy: u64 = rand::thread_rng().gen();
    format!("sale_{}_{entropy:016x}", window_start.timestamp())
}

const ADJECTIVES: &[&str] = &[
    "Aurora", "Crimson", "Ember", "Frost", "Golden", "Ivory", "Jade", "Lunar", "Midnight",
    "Nova", "Obsidian", "Pearl", "Quartz", "Scarlet", "Titan", "Velvet",
];
const CATEGORIES: &[&str] = &[
    "Headphones", "Sneakers", "Backpack", "Watch", "Keyboard", "Lamp", "Tumbler", "Jacket",
    "Camera", "Speaker", "Drone", "Monitor",
];
const VARIANTS: &[&str] = &[
    "Classic", "Limited", "Pro", "Mini", "Max", "Sport", "Travel", "Studio",
];

/// Q item rows for a sale. Ids are unique by construction (ordinal plus an
/// opaque suffix); names cycle a template space and may repeat.
fn generate_items(sale_id: &str, quota: i64, created_at: DateTime<Utc>) -> Vec<item::Model> {
    let mut rng = rand::thread_rng();
    (0..quota)
        .map(|n| {
            let suffix: u32 = rng.gen();
            let item_id = format!("item_{n:05}_{suffix:08x}");
            let name = item_name(n as usize);
            item::Model {
                sale_id: sale_id.to_string(),
                item_id: item_id.clone(),
                name,
                image_ref: Some(format!("items/{item_id}.webp")),
                created_at,
            }
        })
        .collect()
}

fn item_name(n: usize) -> String {
    let adjective = ADJECTIVES[n % ADJECTIVES.len()];
    let category = CATEGORIES[(n / ADJECTIVES.len()) % CATEGORIES.len()];
    let variant = VARIANTS[(n / (ADJECTIVES.len() * CATEGORIES.len())) % VARIANTS.len()];
    format!("{adjective} {category} {variant}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_window_bounds_align_to_boundary() {
        let window = Duration::from_secs(3600);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 14, 37, 21).unwrap();
        let (start, end) = window_bounds(now, window);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_window_bounds_exact_boundary_starts_new_window() {
        let window = Duration::from_secs(3600);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap();
        let (start, end) = window_bounds(now, window);
        assert_eq!(start, now);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap());
    }

    #[test]
    fn test_window_bounds_sub_hour_window() {
        let window = Duration::from_secs(900);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 14, 16, 2).unwrap();
        let (start, end) = window_bounds(now, window);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 14, 15, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_mint_sale_id_embeds_window_and_is_unique() {
        let ws = Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap();
        let a = mint_sale_id(ws);
        let b = mint_sale_id(ws);
        assert!(a.starts_with(&format!("sale_{}_", ws.timestamp())));
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_items_quota_and_unique_ids() {
        let items = generate_items("s1", 2500, Utc::now());
        assert_eq!(items.len(), 2500);
        let ids: HashSet<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids.len(), 2500);
        assert!(items.iter().all(|i| i.sale_id == "s1"));
        assert!(items.iter().all(|i| !i.name.is_empty()));
    }

    #[test]
    fn test_item_names_cycle_template_space() {
        // Distinct early ordinals get distinct names; far-apart ordinals may
        // legitimately repeat.
        let names: HashSet<String> = (0..100).map(item_name).collect();
        assert_eq!(names.len(), 100);
    }
}
