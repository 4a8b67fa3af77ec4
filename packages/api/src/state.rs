//! Application state: the composition root.
//!
//! Built once at startup, clients first, then services, and injected into
//! handlers as `AppState`. Handlers own nothing; everything they touch hangs
//! off this struct.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectOptions, Database};

use crate::checkout::CheckoutService;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorError, RedisCoordinator};
use crate::middleware::rate_limit::{build_limiter, IpRateLimiter};
use crate::purchase::PurchaseService;
use crate::scheduler::{sale_key_ttl, Scheduler};
use crate::store::{schema, PostgresSaleStore, SaleStore};

pub type AppState = Arc<State>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("database init failed: {0}")]
    Database(String),
    #[error("coordinator init failed: {0}")]
    Coordinator(#[from] CoordinatorError),
}

pub struct State {
    pub config: Config,
    pub store: Arc<dyn SaleStore>,
    pub coordinator: Arc<dyn Coordinator>,
    pub checkout: CheckoutService,
    pub purchase: PurchaseService,
    pub scheduler: Arc<Scheduler>,
    pub rate_limiter: IpRateLimiter,
}

impl State {
    /// Connects to Postgres and Redis and wires the services. Fails fast so
    /// the process can exit non-zero on an unreachable dependency.
    pub async fn new(config: Config) -> Result<Self, StateError> {
        let mut options = ConnectOptions::new(config.database.url());
        options
            .max_connections(10)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8))
            // A fraction of the request deadline, so a starved pool surfaces
            // as Transient instead of eating the whole request deadline.
            .acquire_timeout(Duration::from_secs(5))
            .sqlx_logging(false);
        let db = Database::connect(options)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;
        schema::migrate(&db)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;
        let store: Arc<dyn SaleStore> = Arc::new(PostgresSaleStore::new(db));

        let coordinator: Arc<dyn Coordinator> =
            Arc::new(RedisCoordinator::new(&config.redis.url()).await?);
        coordinator.ping().await?;

        Ok(Self::assemble(config, store, coordinator))
    }

    /// Pure wiring over already-constructed backends. Tests use this with
    /// the in-memory store and coordinator.
    pub fn assemble(
        config: Config,
        store: Arc<dyn SaleStore>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let counter_ttl = sale_key_ttl(config.sale_window);
        let checkout = CheckoutService::new(
            store.clone(),
            coordinator.clone(),
            config.user_limit,
            config.session_ttl,
        );
        let purchase = PurchaseService::new(
            store.clone(),
            coordinator.clone(),
            config.user_limit,
            counter_ttl,
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            coordinator.clone(),
            config.items_per_sale,
            config.sale_window,
        ));
        let rate_limiter = build_limiter(config.rate_limit_per_second, config.rate_limit_burst);

        Self {
            config,
            store,
            coordinator,
            checkout,
            purchase,
            scheduler,
            rate_limiter,
        }
    }
}
