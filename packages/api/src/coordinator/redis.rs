//! Redis coordinator backend.
//!
//! Sessions are JSON strings with native TTL; counters are plain integer
//! keys. The redemption sequence runs as a Lua script so the whole step is
//! one atomic evaluation on the server: concurrent redemptions of the same
//! code, cap races and inventory races all serialise inside Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{
    active_key, inventory_key, session_key, user_count_key, Coordinator, CoordinatorError,
    RedeemOutcome, SessionRecord,
};

/// The compound redemption step. KEYS[1] is the session key; the inventory
/// and counter keys are derived from the session payload, so the whole
/// decision runs against a consistent snapshot of one code.
///
/// Returns `{status, ...}` where status is one of `ok` (followed by sale_id,
/// user_id, item_id), `invalid`, `limit`, `soldout`.
const REDEEM_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return {'invalid'}
end
local session = cjson.decode(raw)
local count_key = 'sale:' .. session['sale_id'] .. ':user:' .. session['user_id'] .. ':count'
local inventory_key = 'sale:' .. session['sale_id'] .. ':inventory'
local cap = tonumber(ARGV[1])
local used = tonumber(redis.call('GET', count_key) or '0')
if used >= cap then
  return {'limit'}
end
local remaining = redis.call('DECR', inventory_key)
if remaining < 0 then
  redis.call('INCR', inventory_key)
  return {'soldout'}
end
redis.call('INCR', count_key)
redis.call('PEXPIRE', count_key, tonumber(ARGV[2]))
redis.call('DEL', KEYS[1])
return {'ok', session['sale_id'], session['user_id'], session['item_id'], tostring(remaining)}
"#;

pub struct RedisCoordinator {
    conn: ConnectionManager,
    redeem_script: Script,
}

impl RedisCoordinator {
    pub async fn new(url: &str) -> Result<Self, CoordinatorError> {
        let client = redis::Client::open(url)
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            redeem_script: Script::new(REDEEM_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        // ConnectionManager multiplexes; a clone per operation avoids
        // serialising concurrent handlers behind a lock.
        self.conn.clone()
    }
}

impl std::fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinator").finish_non_exhaustive()
    }
}

fn backend_err(e: redis::RedisError) -> CoordinatorError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        CoordinatorError::Connection(e.to_string())
    } else {
        CoordinatorError::Backend(e.to_string())
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn ping(&self) -> Result<(), CoordinatorError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn init_sale(
        &self,
        sale_id: &str,
        quota: i64,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        let created: Option<String> = redis::cmd("SET")
            .arg(inventory_key(sale_id))
            .arg(quota)
            .arg("NX")
            .arg("EX")
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        let _: Option<String> = redis::cmd("SET")
            .arg(active_key(sale_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(created.is_some())
    }

    async fn clear_sale(&self, sale_id: &str) -> Result<(), CoordinatorError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(active_key(sale_id))
            .await
            .map_err(backend_err)
    }

    async fn sale_active(&self, sale_id: &str) -> Result<bool, CoordinatorError> {
        let mut conn = self.conn();
        conn.exists(active_key(sale_id)).await.map_err(backend_err)
    }

    async fn inventory(&self, sale_id: &str) -> Result<Option<i64>, CoordinatorError> {
        let mut conn = self.conn();
        conn.get(inventory_key(sale_id)).await.map_err(backend_err)
    }

    async fn user_count(&self, sale_id: &str, user_id: &str) -> Result<i64, CoordinatorError> {
        let mut conn = self.conn();
        let count: Option<i64> = conn
            .get(user_count_key(sale_id, user_id))
            .await
            .map_err(backend_err)?;
        Ok(count.unwrap_or(0))
    }

    async fn put_session(
        &self,
        code: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let json = serde_json::to_string(record)
            .map_err(|e| CoordinatorError::Serialization(e.to_string()))?;
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(session_key(code))
            .arg(json)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(set.is_some())
    }

    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>, CoordinatorError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(session_key(code)).await.map_err(backend_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CoordinatorError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn delete_session(&self, code: &str) -> Result<(), CoordinatorError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(session_key(code))
            .await
            .map_err(backend_err)
    }

    async fn redeem(
        &self,
        code: &str,
        user_cap: i64,
        counter_ttl: Duration,
    ) -> Result<RedeemOutcome, CoordinatorError> {
        let mut conn = self.conn();
        let reply: Vec<String> = self
            .redeem_script
            .key(session_key(code))
            .arg(user_cap)
            .arg(counter_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        match reply.first().map(String::as_str) {
            Some("ok") if reply.len() == 5 => Ok(RedeemOutcome::Redeemed {
                sale_id: reply[1].clone(),
                user_id: reply[2].clone(),
                item_id: reply[3].clone(),
                remaining: reply[4].parse().map_err(|_| {
                    CoordinatorError::Backend(format!("non-numeric remaining: {}", reply[4]))
                })?,
            }),
            Some("invalid") => Ok(RedeemOutcome::InvalidCode),
            Some("limit") => Ok(RedeemOutcome::UserLimitExceeded),
            Some("soldout") => Ok(RedeemOutcome::SoldOut),
            other => Err(CoordinatorError::Backend(format!(
                "unexpected redeem reply: {other:?}"
            ))),
        }
    }
}
