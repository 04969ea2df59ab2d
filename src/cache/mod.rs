//! # Shared Cache
//!
//! Remote key-value store shared by every gateway instance. The admission
//! core needs only a small surface from it: fixed-window counters with
//! expiry, and hash objects with a time-to-live for cached credentials.
//!
//! The cache is optional. Components hold an `Option<Arc<dyn SharedCache>>`
//! and fall back to process-local behaviour when it is absent.

mod memory;
mod redis_store;

pub use memory::MemoryCache;
pub use redis_store::RedisCache;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by a shared cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed cache data for key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Operations the admission core performs against the shared cache
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Read a counter; a missing key reads as `None`
    async fn get_counter(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Increment a counter and make sure it expires `ttl` after its window opened
    ///
    /// Returns the value after the increment.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    /// Read every field of a hash; a missing key reads as an empty map
    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Replace a hash with `fields` and set its time-to-live
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}
