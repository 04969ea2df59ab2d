//! Sliding window of 10-second buckets for one (channel, model) pairing.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use super::PairingKey;

/// Width of one bucket
pub const BUCKET_SECONDS: i64 = 10;

/// Upper bound on retained buckets (five minutes)
pub const MAX_BUCKETS: usize = 30;

pub const MAX_WINDOW_SECONDS: i64 = BUCKET_SECONDS * MAX_BUCKETS as i64;

/// Start of the 10-second bucket containing `at`
pub fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp().div_euclid(BUCKET_SECONDS) * BUCKET_SECONDS;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(at)
}

/// Telemetry reported after an upstream call completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Time to the first meaningful response byte, when it was measured
    pub first_response: Option<Duration>,
    /// Full call duration
    pub total: Duration,
}

impl Sample {
    pub fn new(first_response: Option<Duration>, total: Duration) -> Self {
        Self {
            first_response,
            total,
        }
    }

    /// Build from adapter-layer units: a negative latency means "not measured"
    ///
    /// Durations too large to represent saturate at `Duration::MAX`; NaN and
    /// non-positive values count as zero.
    pub fn from_raw(latency_ms: i64, duration_secs: f64) -> Self {
        let first_response = u64::try_from(latency_ms).ok().map(Duration::from_millis);
        let total = if duration_secs > 0.0 {
            Duration::try_from_secs_f64(duration_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Self::new(first_response, total)
    }
}

/// Aggregates for one 10-second slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalBucket {
    pub start: DateTime<Utc>,
    pub total_count: u64,
    /// Samples that carried a first-response latency
    pub latency_count: u64,
    pub total_latency_ms: u64,
    pub total_duration_ms: u64,
}

impl IntervalBucket {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            total_count: 0,
            latency_count: 0,
            total_latency_ms: 0,
            total_duration_ms: 0,
        }
    }

    fn add(&mut self, sample: &Sample) {
        self.total_count = self.total_count.saturating_add(1);
        self.total_duration_ms = self.total_duration_ms.saturating_add(millis(sample.total));
        if let Some(latency) = sample.first_response {
            self.latency_count = self.latency_count.saturating_add(1);
            self.total_latency_ms = self.total_latency_ms.saturating_add(millis(latency));
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sums over a set of buckets
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total_requests: u64,
    pub latency_samples: u64,
    pub total_latency_ms: u64,
    pub total_duration_ms: u64,
    /// Mean over samples that carried a latency only
    pub avg_latency_ms: f64,
    /// Mean over all samples
    pub avg_duration_secs: f64,
}

impl WindowStats {
    fn accumulate<'a>(buckets: impl Iterator<Item = &'a IntervalBucket>) -> Self {
        let mut stats = Self::default();
        for bucket in buckets {
            stats.total_requests = stats.total_requests.saturating_add(bucket.total_count);
            stats.latency_samples = stats.latency_samples.saturating_add(bucket.latency_count);
            stats.total_latency_ms = stats.total_latency_ms.saturating_add(bucket.total_latency_ms);
            stats.total_duration_ms =
                stats.total_duration_ms.saturating_add(bucket.total_duration_ms);
        }
        if stats.latency_samples > 0 {
            stats.avg_latency_ms = stats.total_latency_ms as f64 / stats.latency_samples as f64;
        }
        if stats.total_requests > 0 {
            stats.avg_duration_secs =
                stats.total_duration_ms as f64 / 1000.0 / stats.total_requests as f64;
        }
        stats
    }
}

#[derive(Debug, Default)]
struct WindowState {
    buckets: VecDeque<IntervalBucket>,
    /// Start of the bucket currently receiving samples
    current: Option<DateTime<Utc>>,
    last_disabled: Option<DateTime<Utc>>,
}

impl WindowState {
    fn rotate(&mut self, start: DateTime<Utc>, window_secs: i64, capacity: usize) {
        let cutoff = start - chrono::Duration::seconds(window_secs);
        self.buckets.retain(|bucket| bucket.start > cutoff);
        self.buckets.push_back(IntervalBucket::new(start));
        while self.buckets.len() > capacity {
            self.buckets.pop_front();
        }
        self.current = Some(start);
    }
}

/// Latency monitor for one pairing
///
/// All mutation goes through `record` and `mark_disabled`, both of which
/// take the write lock, so concurrent recorders never double-rotate.
#[derive(Debug)]
pub struct ChannelHealthMonitor {
    key: PairingKey,
    state: RwLock<WindowState>,
}

impl ChannelHealthMonitor {
    pub fn new(key: PairingKey) -> Self {
        Self {
            key,
            state: RwLock::new(WindowState::default()),
        }
    }

    pub fn key(&self) -> &PairingKey {
        &self.key
    }

    /// Add a sample recorded at `now`, rotating the window when a new bucket starts
    pub fn record(&self, sample: &Sample, now: DateTime<Utc>, window_secs: i64, capacity: usize) {
        let start = bucket_start(now);
        let mut state = self.state.write();

        let advanced = state.current.map_or(true, |current| start > current);
        if advanced || state.buckets.is_empty() {
            state.rotate(start, window_secs, capacity);
        }

        if let Some(bucket) = state.buckets.back_mut() {
            bucket.add(sample);
        }
    }

    /// Stats over every retained bucket, including the open one
    pub fn window_stats(&self) -> WindowStats {
        let state = self.state.read();
        WindowStats::accumulate(state.buckets.iter())
    }

    /// Stats over completed buckets still inside the window ending at `now`
    ///
    /// The bucket for the interval containing `now` is still filling and is
    /// left out, as are buckets that aged past `window_secs` without a
    /// rotation to drop them.
    pub fn completed_window_stats(&self, now: DateTime<Utc>, window_secs: i64) -> WindowStats {
        let open = bucket_start(now);
        let cutoff = open - chrono::Duration::seconds(window_secs);
        let state = self.state.read();
        WindowStats::accumulate(
            state
                .buckets
                .iter()
                .filter(|bucket| bucket.start != open && bucket.start > cutoff),
        )
    }

    /// Stamp a disable and drop the accumulated data
    pub fn mark_disabled(&self, at: DateTime<Utc>) {
        let mut state = self.state.write();
        state.buckets.clear();
        state.current = None;
        state.last_disabled = Some(at);
    }

    pub fn last_disabled(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_disabled
    }

    pub fn bucket_count(&self) -> usize {
        self.state.read().buckets.len()
    }

    pub fn buckets(&self) -> Vec<IntervalBucket> {
        self.state.read().buckets.iter().cloned().collect()
    }

    /// True when the newest bucket started before `now - idle`, or there is none
    pub fn is_inactive(&self, now: DateTime<Utc>, idle: Duration) -> bool {
        let idle = chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero());
        let state = self.state.read();
        match state.buckets.back() {
            None => true,
            Some(newest) => newest.start < now - idle,
        }
    }
}
