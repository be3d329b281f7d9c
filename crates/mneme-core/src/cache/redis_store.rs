use super::CacheStore;
use crate::error::{Error, Result};
use crate::thread::{CacheRecord, Thread};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

/// Redis-backed cache store
///
/// Records are stored as JSON under `<prefix><thread_id>` with a
/// millisecond server-side expiry (`SET .. PX`). Every Redis error is
/// reported as [`Error::StoreUnavailable`].
pub struct RedisCacheStore {
    client: redis::Client,
    /// Key prefix for thread keys
    prefix: String,
}

impl RedisCacheStore {
    /// Create a new Redis store with the default `chat:` prefix
    ///
    /// # Errors
    ///
    /// Returns error if Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, "chat:")
    }

    /// Create with custom key prefix
    ///
    /// # Errors
    ///
    /// Returns error if Redis URL is invalid
    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| Error::InvalidConfig {
            field: "cache.redis_url".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    fn build_key(&self, thread_id: &str) -> String {
        format!("{}{}", self.prefix, thread_id)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::cache_unavailable(format!("Redis connection failed: {}", e)))
    }
}

fn unavailable(op: &str) -> impl FnOnce(redis::RedisError) -> Error + '_ {
    move |e| Error::cache_unavailable(format!("Redis {} failed: {}", op, e))
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, thread_id: &str) -> Result<Option<CacheRecord>> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(thread_id);

        let data: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable("GET"))?;

        let Some(json) = data else {
            return Ok(None);
        };
        let record: CacheRecord = serde_json::from_str(&json)?;
        if record.is_expired(Utc::now()) {
            debug!(thread_id = %thread_id, "Redis returned a record past its expiry");
            return Ok(None);
        }
        debug!(thread_id = %thread_id, "Thread loaded from Redis");
        Ok(Some(record))
    }

    async fn put(&self, thread: &Thread, ttl: Duration) -> Result<CacheRecord> {
        let record = CacheRecord::new(thread.clone(), ttl);
        let mut conn = self.get_connection().await?;
        let key = self.build_key(&thread.id);

        let ttl_ms = ttl.as_millis().min(u128::from(u64::MAX)) as u64;
        if ttl_ms == 0 {
            // PX rejects 0; an immediately expired entry is simply absent
            redis::cmd("DEL")
                .arg(&key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(unavailable("DEL"))?;
            return Ok(record);
        }

        let json = serde_json::to_string(&record)?;
        redis::cmd("SET")
            .arg(&key)
            .arg(&json)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable("SET"))?;

        debug!(thread_id = %thread.id, ttl_ms = ttl_ms, "Thread cached in Redis");
        Ok(record)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(thread_id);

        let deleted: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable("DEL"))?;

        debug!(thread_id = %thread_id, deleted = deleted > 0, "Thread deleted from Redis");
        Ok(deleted > 0)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let pattern = format!("{}*", self.prefix);

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .map_err(unavailable("KEYS"))?;

        let ids: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(|s| s.to_string()))
            .collect();

        warn!(count = ids.len(), "Listed all thread keys from Redis (use with caution)");
        Ok(ids)
    }
}
