//! In-memory coordinator abstraction: fast-path concurrency control.
//!
//! The coordinator is the sole arbiter of contention on inventory and
//! per-user counters. Everything the purchase path needs to decide (session
//! lookup, user-cap ceiling, inventory decrement, session retirement) is
//! executed as one server-evaluated step ([`Coordinator::redeem`]), never as
//! separate round-trips.
//!
//! Key namespaces:
//! - `sale:{sale_id}:inventory`            integer counter
//! - `sale:{sale_id}:user:{user_id}:count` integer counter
//! - `checkout:{code}`                     session record, TTL = T_session
//! - `sale:{sale_id}:active`               flag, TTL = W + margin

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod memory;
mod redis;

pub use memory::MemoryCoordinator;
pub use redis::RedisCoordinator;

pub fn inventory_key(sale_id: &str) -> String {
    format!("sale:{sale_id}:inventory")
}

pub fn user_count_key(sale_id: &str, user_id: &str) -> String {
    format!("sale:{sale_id}:user:{user_id}:count")
}

pub fn session_key(code: &str) -> String {
    format!("checkout:{code}")
}

pub fn active_key(sale_id: &str) -> String {
    format!("sale:{sale_id}:active")
}

/// Ephemeral checkout session as stored under `checkout:{code}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub item_id: String,
    pub sale_id: String,
    /// Unix timestamp millis.
    pub created_at: i64,
}

/// Result of the compound redemption step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// Session consumed, inventory decremented, user counter incremented.
    Redeemed {
        sale_id: String,
        user_id: String,
        item_id: String,
        /// Inventory left after this decrement; 0 means this redemption took
        /// the last slot and the sale can be retired early.
        remaining: i64,
    },
    /// No session under that code (never existed, expired, or already
    /// redeemed).
    InvalidCode,
    /// The user is at the cap; nothing was mutated.
    UserLimitExceeded,
    /// Inventory exhausted; the decrement was reverted, the session kept.
    SoldOut,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("coordinator error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Primitives the checkout/purchase/scheduler paths need from the
/// coordinator. Redis-backed in production; the in-memory backend runs the
/// same sequences under a single lock for tests.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), CoordinatorError>;

    /// Set-if-absent initialisation of a sale: inventory counter to `quota`
    /// and the active flag, both with `ttl`. Returns `true` when the counter
    /// was freshly created (idempotent under scheduler retries).
    async fn init_sale(
        &self,
        sale_id: &str,
        quota: i64,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError>;

    /// Drops the active flag at rollover/completion. Counters are left to
    /// their TTLs.
    async fn clear_sale(&self, sale_id: &str) -> Result<(), CoordinatorError>;

    async fn sale_active(&self, sale_id: &str) -> Result<bool, CoordinatorError>;

    /// Current inventory counter, if the key exists.
    async fn inventory(&self, sale_id: &str) -> Result<Option<i64>, CoordinatorError>;

    /// Successful purchases recorded for (sale, user); 0 when absent.
    async fn user_count(&self, sale_id: &str, user_id: &str) -> Result<i64, CoordinatorError>;

    /// Set-if-absent session write with TTL. Returns `false` when a session
    /// already exists under the code.
    async fn put_session(
        &self,
        code: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError>;

    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>, CoordinatorError>;

    async fn delete_session(&self, code: &str) -> Result<(), CoordinatorError>;

    /// The compound atomic step of the purchase path: session lookup,
    /// user-cap ceiling check, decrement-if-positive on the inventory,
    /// user-counter increment, session deletion. One isolated operation,
    /// linearizable with respect to other coordinator operations on the same
    /// keys. On any rejection every effect is rolled back within the step.
    async fn redeem(
        &self,
        code: &str,
        user_cap: i64,
        counter_ttl: Duration,
    ) -> Result<RedeemOutcome, CoordinatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema() {
        assert_eq!(inventory_key("s1"), "sale:s1:inventory");
        assert_eq!(user_count_key("s1", "u1"), "sale:s1:user:u1:count");
        assert_eq!(session_key("chk_abc"), "checkout:chk_abc");
        assert_eq!(active_key("s1"), "sale:s1:active");
    }

    #[test]
    fn test_session_record_roundtrip() {
        let record = SessionRecord {
            user_id: "u1".into(),
            item_id: "i1".into(),
            sale_id: "s1".into(),
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
