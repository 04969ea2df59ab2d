//! Fixed-window counters in the shared cache.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use super::{RateLimitBackend, RateLimitError};
use crate::cache::SharedCache;

/// Backend whose counters are shared by every gateway instance
///
/// One counter per `(key, window)`; the counter expires `window` after the
/// first request recorded in it.
#[derive(Clone)]
pub struct SharedBackend {
    cache: Arc<dyn SharedCache>,
}

impl SharedBackend {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    pub fn counter_key(key: &str, window: Duration) -> String {
        format!("rate_limit:{}:{}", key, window.as_secs())
    }
}

#[async_trait]
impl RateLimitBackend for SharedBackend {
    async fn allow(
        &self,
        key: &str,
        window: Duration,
        max_count: u64,
    ) -> Result<bool, RateLimitError> {
        let counter_key = Self::counter_key(key, window);
        let count = self.cache.get_counter(&counter_key).await.map_err(|e| {
            error!(key = %counter_key, error = %e, "Shared rate limit check failed");
            RateLimitError::from(e)
        })?;

        let count = u64::try_from(count.unwrap_or(0)).unwrap_or(0);
        Ok(count < max_count)
    }

    async fn record(
        &self,
        key: &str,
        window: Duration,
        _max_count: u64,
    ) -> Result<(), RateLimitError> {
        let counter_key = Self::counter_key(key, window);
        self.cache
            .incr_with_expiry(&counter_key, window)
            .await
            .map_err(|e| {
                error!(key = %counter_key, error = %e, "Shared rate limit record failed");
                RateLimitError::from(e)
            })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}
