//! Process-local fixed-window counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RateLimitBackend, RateLimitError};
use crate::core::clock::{system_clock, Clock};
use crate::core::tasks::spawn_periodic;

#[derive(Debug, Clone)]
struct LocalWindow {
    count: u64,
    started_at: DateTime<Utc>,
    length: Duration,
}

impl LocalWindow {
    fn new(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            count: 0,
            started_at: now,
            length,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let length =
            chrono::Duration::from_std(self.length).unwrap_or_else(|_| chrono::Duration::zero());
        now >= self.started_at + length
    }

    fn reset_if_expired(&mut self, now: DateTime<Utc>, length: Duration) {
        if self.is_expired(now) {
            *self = Self::new(now, length);
        }
    }
}

/// In-memory backend keyed by the limiter key
pub struct LocalBackend {
    windows: DashMap<String, LocalWindow>,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Drop windows that have expired
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Purge expired windows every `period` until `cancel` fires
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        spawn_periodic("rate-limit-cleanup", period, cancel, move || {
            let purged = backend.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired local rate limit windows");
            }
            async {}
        })
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    async fn allow(
        &self,
        key: &str,
        window: Duration,
        max_count: u64,
    ) -> Result<bool, RateLimitError> {
        let now = self.clock.now();
        match self.windows.get_mut(key) {
            None => Ok(max_count > 0),
            Some(mut entry) => {
                entry.reset_if_expired(now, window);
                Ok(entry.count < max_count)
            }
        }
    }

    async fn record(
        &self,
        key: &str,
        window: Duration,
        _max_count: u64,
    ) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| LocalWindow::new(now, window));
        entry.reset_if_expired(now, window);
        entry.count += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(60);

    fn backend() -> (LocalBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        (LocalBackend::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_exactly_max_count_admitted() {
        let (backend, _) = backend();
        for _ in 0..5 {
            assert!(backend.allow("CRRL:1", WINDOW, 5).await.unwrap());
            backend.record("CRRL:1", WINDOW, 5).await.unwrap();
        }
        assert!(!backend.allow("CRRL:1", WINDOW, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_window_resets_before_comparison() {
        let (backend, clock) = backend();
        backend.record("k", WINDOW, 1).await.unwrap();
        assert!(!backend.allow("k", WINDOW, 1).await.unwrap());

        clock.advance(Duration::from_secs(59));
        assert!(!backend.allow("k", WINDOW, 1).await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(backend.allow("k", WINDOW, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_does_not_count() {
        let (backend, _) = backend();
        for _ in 0..10 {
            assert!(backend.allow("k", WINDOW, 1).await.unwrap());
        }
        assert_eq!(backend.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (backend, clock) = backend();
        backend.record("a", WINDOW, 1).await.unwrap();
        clock.advance(Duration::from_secs(30));
        backend.record("b", WINDOW, 1).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.tracked_keys(), 1);
    }
}
