//! Durable store abstraction over sales, items, checkouts, purchases, users.
//!
//! The store owns long-term truth and crash recovery. It is deliberately not
//! the arbiter of purchase contention (the coordinator is); its uniqueness
//! constraints are the last-line guard that prevents double-spend even if the
//! two planes disagree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::{checkout, item, purchase, sale};

mod memory;
mod postgres;
pub mod schema;

pub use memory::MemorySaleStore;
pub use postgres::PostgresSaleStore;

/// Snapshot returned by [`SaleStore::get_sale_stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleStats {
    pub total_items: i64,
    /// Count of purchase rows for the sale; ≤ `total_items` by construction.
    pub items_sold: i64,
}

/// Error type for durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("uniqueness conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        use sea_orm::{DbErr, SqlErr};
        if let Some(SqlErr::UniqueConstraintViolation(constraint)) = err.sql_err() {
            return StoreError::Conflict(constraint);
        }
        match err {
            DbErr::RecordNotFound(_) => StoreError::NotFound,
            DbErr::Conn(e) => StoreError::Connection(e.to_string()),
            DbErr::ConnectionAcquire(e) => StoreError::Connection(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Typed operations the rest of the system performs against the durable
/// store. Backed by Postgres in production and by an in-memory implementation
/// with the same uniqueness semantics for tests.
#[async_trait]
pub trait SaleStore: Send + Sync {
    /// Connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Inserts a sale row. Fails with [`StoreError::Conflict`] when a sale
    /// with the same `window_start` already exists; the caller adopts that
    /// row instead (this is the leader election for concurrent schedulers).
    async fn create_sale(&self, sale: sale::Model) -> Result<(), StoreError>;

    /// Bulk-inserts the items of a sale, all or none, inside one transaction.
    async fn create_items(&self, items: Vec<item::Model>) -> Result<(), StoreError>;

    async fn get_sale(&self, sale_id: &str) -> Result<sale::Model, StoreError>;

    /// The sale with status `active` whose window contains `now`.
    async fn get_active_sale(&self, now: DateTime<Utc>) -> Result<sale::Model, StoreError>;

    /// Lookup by window start, used to adopt the winner after a lost
    /// creation race and to find a pre-staged sale at its boundary.
    /// Cancelled sales are invisible here, matching the partial unique
    /// index.
    async fn find_sale_by_window_start(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<sale::Model, StoreError>;

    /// Flips a pre-staged sale from scheduled to active at its window
    /// boundary. No-op when already active.
    async fn activate_sale(&self, sale_id: &str) -> Result<(), StoreError>;

    /// Idempotent: a sale already completed stays completed. Called both by
    /// the sweep at window end and by the purchase path when the quota
    /// sells out early.
    async fn mark_sale_completed(&self, sale_id: &str) -> Result<(), StoreError>;

    /// Idempotent. Used when sale initialisation fails partway.
    async fn mark_sale_cancelled(&self, sale_id: &str) -> Result<(), StoreError>;

    async fn item_exists(&self, sale_id: &str, item_id: &str) -> Result<bool, StoreError>;

    /// Lazily creates the user row; a pre-existing row is not an error.
    async fn ensure_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Unique on `code`.
    async fn insert_checkout(&self, row: checkout::Model) -> Result<(), StoreError>;

    /// Flips a pending checkout to redeemed. No-op when already terminal.
    async fn mark_checkout_redeemed(&self, code: &str) -> Result<(), StoreError>;

    /// Sweeper support: flips pending checkouts past their expiry to
    /// `expired`. Returns the number of rows touched.
    async fn expire_stale_checkouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Sweeper support: marks active sales whose window has ended as
    /// completed and returns their ids so coordinator flags can be cleared.
    async fn complete_finished_sales(&self, now: DateTime<Utc>)
        -> Result<Vec<String>, StoreError>;

    /// Unique on `purchase_id` and on (sale_id, item_id); fails with
    /// [`StoreError::Conflict`] on either duplicate.
    async fn insert_purchase(&self, row: purchase::Model) -> Result<(), StoreError>;

    async fn get_sale_stats(&self, sale_id: &str) -> Result<SaleStats, StoreError>;
}

impl StoreError {
    /// Whether the caller may retry the operation (connectivity trouble as
    /// opposed to a semantic failure).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Database(_))
    }
}
