//! Redis-backed shared cache.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{CacheError, CacheResult, SharedCache};
use crate::core::config::RedisConfig;

/// Redis cache implementation
///
/// Every round trip is bounded by `RedisConfig::timeout`; a call that runs
/// past it fails with [`CacheError::Timeout`] and callers treat that like any
/// other backend failure.
#[derive(Clone)]
pub struct RedisCache {
    config: RedisConfig,
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect to redis
    pub async fn connect(config: RedisConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let connection = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(config.timeout))??;

        info!("Redis cache connected to {}", config.url);

        Ok(Self { config, connection })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, operation).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.config.timeout)),
        }
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get_counter(&self, key: &str) -> CacheResult<Option<i64>> {
        let full_key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.bounded(async move { conn.get::<_, Option<i64>>(&full_key).await })
            .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let mut conn = self.connection.clone();

        self.bounded(async move {
            let (count, remaining): (i64, i64) = redis::pipe()
                .atomic()
                .incr(&full_key, 1)
                .ttl(&full_key)
                .query_async(&mut conn)
                .await?;

            // A key without a TTL was just created, or lost its expiry
            if remaining < 0 {
                conn.expire::<_, ()>(&full_key, ttl_secs).await?;
            }
            Ok::<i64, redis::RedisError>(count)
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let full_key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.bounded(async move { conn.hgetall::<_, HashMap<String, String>>(&full_key).await })
            .await
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let mut conn = self.connection.clone();
        let fields = fields.to_vec();

        self.bounded(async move {
            redis::pipe()
                .atomic()
                .del(&full_key)
                .ignore()
                .hset_multiple(&full_key, &fields[..])
                .ignore()
                .expire(&full_key, ttl_secs)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await?;

        debug!("Set redis hash {} with TTL {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.connection.clone();
        self.bounded(async move { conn.del::<_, ()>(&full_key).await })
            .await
    }
}
