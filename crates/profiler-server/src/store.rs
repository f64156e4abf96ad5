//! Redis-backed remote session store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use profiler_auth::{
    InMemorySessionStore, SessionRecord, SessionStore, StoreError, session_key,
};
use redis::AsyncCommands;

use crate::config::{AppConfig, RedisConfig};

/// Session records stored as `user:{id}` JSON strings with `EX ttl`.
///
/// Every clone shares the same connection pool. Connections are opened on
/// first use, and reads degrade to misses when Redis is unreachable.
#[derive(Clone)]
pub struct RedisSessionStore {
    pool: Pool,
    ttl: Duration,
}

impl RedisSessionStore {
    pub fn new(pool: Pool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, user_id: &str) -> Option<SessionRecord> {
        let key = session_key(user_id);
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis pool error on GET");
                return None;
            }
        };

        let payload = match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!(key = %key, "session store miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis GET error");
                return None;
            }
        };

        match serde_json::from_str(&payload) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Undecodable session record");
                None
            }
        }
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let key = session_key(&record.user_id);
        let payload =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.pool.get().await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Redis pool error on SET");
            StoreError::Connection(e.to_string())
        })?;

        conn.set_ex::<_, _, ()>(&key, payload, self.ttl.as_secs())
            .await
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "Redis SET error");
                StoreError::Command(e.to_string())
            })?;

        tracing::debug!(key = %key, ttl_secs = self.ttl.as_secs(), "session stored");
        Ok(())
    }

    async fn invalidate(&self, user_id: &str) {
        let key = session_key(user_id);
        match self.pool.get().await {
            Ok(mut conn) => {
                if let Err(e) = conn.del::<_, ()>(&key).await {
                    tracing::warn!(key = %key, error = %e, "Redis DEL error");
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Redis pool error on DEL");
            }
        }
    }

    async fn is_available(&self) -> bool {
        self.pool.get().await.is_ok()
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!("Redis session store pool closed");
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Builds the connection pool for `config`. No connection is opened yet.
pub fn create_redis_pool(config: &RedisConfig) -> Result<Pool, StoreError> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| StoreError::Connection(e.to_string()))
}

/// Creates the remote session store for the configured deployment.
///
/// Falls back to a per-process store when Redis is disabled or the pool
/// cannot be built. An unreachable server only logs a warning: the pool
/// reconnects on demand and reads degrade to misses meanwhile.
pub async fn create_session_store(config: &AppConfig) -> Arc<dyn SessionStore> {
    let ttl = config.session_ttl();

    if !config.redis.enabled {
        tracing::info!("Redis disabled, sessions are shared within this process only");
        return InMemorySessionStore::shared(ttl);
    }

    tracing::info!(url = %config.redis.url, "Connecting to Redis");

    let pool = match create_redis_pool(&config.redis) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process session store."
            );
            return InMemorySessionStore::shared(ttl);
        }
    };

    match pool.get().await {
        Ok(_) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis is not reachable yet; session reads will miss until it is"
        ),
    }

    Arc::new(RedisSessionStore::new(pool, ttl))
}
