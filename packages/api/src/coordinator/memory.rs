//! In-memory coordinator backend.
//!
//! Every operation takes the single inner lock, which makes the redemption
//! sequence trivially linearizable, the same contract the Lua script gives
//! the Redis backend. Single-process only; used by the test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Coordinator, CoordinatorError, RedeemOutcome, SessionRecord};

#[derive(Default)]
struct Inner {
    /// sale_id -> remaining inventory.
    inventory: HashMap<String, i64>,
    /// (sale_id, user_id) -> successful purchases.
    user_counts: HashMap<(String, String), i64>,
    /// code -> (record, expiry).
    sessions: HashMap<String, (SessionRecord, Instant)>,
    /// sale_id -> active-flag expiry.
    active: HashMap<String, Instant>,
}

impl Inner {
    fn live_session(&mut self, code: &str) -> Option<SessionRecord> {
        match self.sessions.get(code) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                self.sessions.remove(code);
                None
            }
            Some((record, _)) => Some(record.clone()),
            None => None,
        }
    }
}

#[derive(Default)]
pub struct MemoryCoordinator {
    inner: Mutex<Inner>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator").finish_non_exhaustive()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn ping(&self) -> Result<(), CoordinatorError> {
        Ok(())
    }

    async fn init_sale(
        &self,
        sale_id: &str,
        quota: i64,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        let created = if inner.inventory.contains_key(sale_id) {
            false
        } else {
            inner.inventory.insert(sale_id.to_string(), quota);
            true
        };
        inner
            .active
            .entry(sale_id.to_string())
            .or_insert_with(|| Instant::now() + ttl);
        Ok(created)
    }

    async fn clear_sale(&self, sale_id: &str) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        inner.active.remove(sale_id);
        Ok(())
    }

    async fn sale_active(&self, sale_id: &str) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        match inner.active.get(sale_id) {
            Some(expiry) if *expiry <= Instant::now() => {
                inner.active.remove(sale_id);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn inventory(&self, sale_id: &str) -> Result<Option<i64>, CoordinatorError> {
        let inner = self.inner.lock().expect("coordinator lock");
        Ok(inner.inventory.get(sale_id).copied())
    }

    async fn user_count(&self, sale_id: &str, user_id: &str) -> Result<i64, CoordinatorError> {
        let inner = self.inner.lock().expect("coordinator lock");
        Ok(inner
            .user_counts
            .get(&(sale_id.to_string(), user_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn put_session(
        &self,
        code: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        if inner.live_session(code).is_some() {
            return Ok(false);
        }
        inner
            .sessions
            .insert(code.to_string(), (record.clone(), Instant::now() + ttl));
        Ok(true)
    }

    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>, CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        Ok(inner.live_session(code))
    }

    async fn delete_session(&self, code: &str) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");
        inner.sessions.remove(code);
        Ok(())
    }

    async fn redeem(
        &self,
        code: &str,
        user_cap: i64,
        _counter_ttl: Duration,
    ) -> Result<RedeemOutcome, CoordinatorError> {
        let mut inner = self.inner.lock().expect("coordinator lock");

        let Some(session) = inner.live_session(code) else {
            return Ok(RedeemOutcome::InvalidCode);
        };

        let count_key = (session.sale_id.clone(), session.user_id.clone());
        let used = inner.user_counts.get(&count_key).copied().unwrap_or(0);
        if used >= user_cap {
            return Ok(RedeemOutcome::UserLimitExceeded);
        }

        let remaining = inner
            .inventory
            .entry(session.sale_id.clone())
            .or_insert(0);
        if *remaining <= 0 {
            return Ok(RedeemOutcome::SoldOut);
        }
        *remaining -= 1;
        let remaining = *remaining;

        *inner.user_counts.entry(count_key).or_insert(0) += 1;
        inner.sessions.remove(code);

        Ok(RedeemOutcome::Redeemed {
            sale_id: session.sale_id,
            user_id: session.user_id,
            item_id: session.item_id,
            remaining,
        })
    }
}
