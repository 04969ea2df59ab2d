//! # Channel Rate Limiting
//!
//! Fixed-window request ceilings per channel (all callers pooled) and per
//! channel per caller. Two interchangeable backends implement the same
//! two-phase contract:
//!
//! 1. `allow` answers whether one more request fits in the current window
//! 2. `record` counts a request that was actually admitted
//!
//! The phases are separate on purpose: the admission gate checks every
//! ceiling (and channel health) before recording against any of them, so a
//! request rejected by a later check does not consume budget from an earlier
//! one. The price is a small race: concurrent callers can all pass `allow`
//! before any of them records, admitting a request or two past the ceiling
//! under heavy contention. Ceilings are therefore approximate.
//!
//! ## Backends
//! - [`LocalBackend`]: process-local counters, no I/O, cannot fail
//! - [`SharedBackend`]: counters in the shared cache, visible to every
//!   gateway instance; a cache failure is surfaced, never read as "allow"

mod local;
mod shared;

pub use local::LocalBackend;
pub use shared::SharedBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::cache::CacheError;

/// Key namespace marker for per-channel ceilings
pub const CHANNEL_MARK: &str = "CRRL";

/// Key namespace marker for per-channel-per-caller ceilings
pub const CALLER_MARK: &str = "CURL";

/// Errors that can occur while checking or recording a ceiling
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend unavailable: {0}")]
    Backend(String),
}

impl From<CacheError> for RateLimitError {
    fn from(err: CacheError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Two-phase fixed-window counter
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Whether one more request under `key` fits in the current window
    async fn allow(&self, key: &str, window: Duration, max_count: u64)
        -> Result<bool, RateLimitError>;

    /// Count one admitted request under `key`
    async fn record(&self, key: &str, window: Duration, max_count: u64)
        -> Result<(), RateLimitError>;

    fn name(&self) -> &'static str;
}

/// Ceilings configured on a channel, in requests per window
///
/// Zero or negative means the ceiling is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    /// All callers pooled
    pub rpm_limit: i64,
    /// Each caller separately
    pub user_rpm_limit: i64,
}

/// Which ceiling a check applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Channel,
    Caller,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Caller => "caller",
        }
    }
}

/// Channel and channel+caller ceilings over a shared backend
#[derive(Clone)]
pub struct ChannelRateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    window: Duration,
}

impl ChannelRateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, window: Duration) -> Self {
        Self { backend, window }
    }

    pub fn channel_key(channel_id: i64) -> String {
        format!("{}:{}", CHANNEL_MARK, channel_id)
    }

    pub fn caller_key(channel_id: i64, caller_id: i64) -> String {
        format!("{}:{}:{}", CALLER_MARK, channel_id, caller_id)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Check the pooled channel ceiling; an unset ceiling always passes
    pub async fn allow_channel(&self, channel_id: i64, limit: i64) -> Result<bool, RateLimitError> {
        self.allow(&Self::channel_key(channel_id), limit).await
    }

    pub async fn record_channel(&self, channel_id: i64, limit: i64) -> Result<(), RateLimitError> {
        self.record(&Self::channel_key(channel_id), limit).await
    }

    /// Check the per-caller ceiling on a channel; an unset ceiling always passes
    pub async fn allow_caller(
        &self,
        channel_id: i64,
        caller_id: i64,
        limit: i64,
    ) -> Result<bool, RateLimitError> {
        self.allow(&Self::caller_key(channel_id, caller_id), limit).await
    }

    pub async fn record_caller(
        &self,
        channel_id: i64,
        caller_id: i64,
        limit: i64,
    ) -> Result<(), RateLimitError> {
        self.record(&Self::caller_key(channel_id, caller_id), limit).await
    }

    async fn allow(&self, key: &str, limit: i64) -> Result<bool, RateLimitError> {
        let Some(max_count) = positive(limit) else {
            return Ok(true);
        };
        let allowed = self.backend.allow(key, self.window, max_count).await?;
        debug!(key, max_count, allowed, backend = self.backend.name(), "Rate limit check");
        Ok(allowed)
    }

    async fn record(&self, key: &str, limit: i64) -> Result<(), RateLimitError> {
        let Some(max_count) = positive(limit) else {
            return Ok(());
        };
        self.backend.record(key, self.window, max_count).await
    }
}

fn positive(limit: i64) -> Option<u64> {
    u64::try_from(limit).ok().filter(|limit| *limit > 0)
}
