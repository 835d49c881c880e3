//! Redis-backed confirmation store.
//!
//! Records are JSON strings under `pending:{prefix}:{id}` with a native key
//! TTL. `create` uses `SET NX PX` so an existing key is never overwritten and
//! `take` is a Lua `GET`+`DEL` script, which Redis runs atomically.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::record::PendingConfirmation;
use super::store::{ConfirmationStore, storage_key};
use crate::{Error, Result};

const TAKE_SCRIPT: &str = r"
local value = redis.call('GET', KEYS[1])
if value then
    redis.call('DEL', KEYS[1])
end
return value
";

/// Confirmation store shared by every gateway instance through Redis.
#[derive(Clone)]
pub struct RedisConfirmationStore {
    conn: ConnectionManager,
    take: redis::Script,
}

impl RedisConfirmationStore {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid URL and
    /// `Error::ConfirmationStoreUnavailable` if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid confirmation.redis_url: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Connected to Redis confirmation store");
        Ok(Self {
            conn,
            take: redis::Script::new(TAKE_SCRIPT),
        })
    }
}

fn unavailable(err: redis::RedisError) -> Error {
    Error::ConfirmationStoreUnavailable(err.to_string())
}

fn decode(raw: Option<String>) -> Result<Option<PendingConfirmation>> {
    raw.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| Error::ConfirmationStoreUnavailable(format!("corrupt record: {e}")))
    })
    .transpose()
}

#[async_trait::async_trait]
impl ConfirmationStore for RedisConfirmationStore {
    async fn create(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
        record: &PendingConfirmation,
        ttl: Duration,
    ) -> Result<()> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let json = serde_json::to_string(record)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if stored.is_none() {
            return Err(Error::ConfirmationIdCollision(confirmation_id.to_string()));
        }
        debug!(key, ttl_ms, "Stored pending confirmation");
        Ok(())
    }

    async fn get(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(unavailable)?;
        decode(raw)
    }

    async fn delete(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(&key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn exists(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let mut conn = self.conn.clone();
        conn.exists(&key).await.map_err(unavailable)
    }

    async fn take(
        &self,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Result<Option<PendingConfirmation>> {
        let key = storage_key(service_key_prefix, confirmation_id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .take
            .key(&key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        decode(raw)
    }
}
