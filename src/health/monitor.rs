//! Process-wide registry of pairing monitors and quarantined pairings.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::{reload_from_source, HealthConfigSource, HealthConfigStore};
use super::window::{ChannelHealthMonitor, Sample, WindowStats, MAX_WINDOW_SECONDS};
use super::PairingKey;
use crate::core::clock::{system_clock, Clock};
use crate::observability::metrics as gateway_metrics;

/// A quarantined pairing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisabledEntry {
    pub channel_id: i64,
    pub model: String,
    pub disabled_at: DateTime<Utc>,
    pub reason: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl DisabledEntry {
    /// First instant at which the pairing is usable again
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.disabled_at
            + chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Point-in-time view of one monitor, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub channel_id: i64,
    pub model: String,
    pub buckets: usize,
    pub window: WindowStats,
    pub completed: WindowStats,
    pub last_disabled: Option<DateTime<Utc>>,
    pub disabled: Option<DisabledEntry>,
}

/// Channel health monitor
///
/// Holds one [`ChannelHealthMonitor`] per active pairing and the set of
/// quarantined pairings. The quarantine entry is the only source of truth
/// for "is this pairing cooling down": evaluation skips a pairing exactly
/// while its entry is unexpired, and availability checks report it disabled
/// over the same interval.
pub struct HealthMonitor {
    config: Arc<HealthConfigStore>,
    monitors: DashMap<PairingKey, ChannelHealthMonitor>,
    disabled: DashMap<PairingKey, DisabledEntry>,
    clock: Arc<dyn Clock>,
    inactive_after: Duration,
}

impl HealthMonitor {
    pub fn new(config: Arc<HealthConfigStore>) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: Arc<HealthConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            monitors: DashMap::new(),
            disabled: DashMap::new(),
            clock,
            inactive_after: Duration::from_secs(15 * 60),
        }
    }

    /// Override how long a monitor may go without samples before cleanup
    pub fn with_inactive_after(mut self, inactive_after: Duration) -> Self {
        self.inactive_after = inactive_after;
        self
    }

    pub fn config(&self) -> &Arc<HealthConfigStore> {
        &self.config
    }

    /// Re-read the thresholds document; failures keep the last good one
    pub async fn reload_config(&self, source: &dyn HealthConfigSource) -> bool {
        reload_from_source(&self.config, source).await
    }

    /// Record telemetry for a completed upstream call
    ///
    /// Pairings without enabled monitoring are ignored; the monitor for a
    /// monitored pairing is created on its first sample.
    pub fn record_sample(&self, channel_id: i64, model: &str, sample: Sample) {
        let key = PairingKey::new(channel_id, model);
        let Some(config) = self.config.lookup_enabled(&key) else {
            return;
        };

        let now = self.clock.now();
        let window_secs = config.effective_window_secs();
        let capacity = config.bucket_capacity();

        let monitor = match self.monitors.get(&key) {
            Some(monitor) => monitor,
            None => self
                .monitors
                .entry(key.clone())
                .or_insert_with(|| ChannelHealthMonitor::new(key))
                .downgrade(),
        };
        monitor.record(&sample, now, window_secs, capacity);
    }

    /// Evaluate every monitor's completed window and quarantine degraded pairings
    ///
    /// Returns the number of pairings disabled by this pass.
    pub fn evaluate_and_maybe_disable(&self) -> usize {
        if !self.config.any_enabled() {
            return 0;
        }

        let now = self.clock.now();
        let mut disabled_count = 0;

        for monitor in self.monitors.iter() {
            let key = monitor.key();

            let Some(config) = self.config.lookup_enabled(key) else {
                continue;
            };
            if !config.can_disable() {
                continue;
            }
            if self.in_cooldown(key, now) {
                continue;
            }

            let stats = monitor.completed_window_stats(now, config.effective_window_secs());
            if stats.total_requests == 0 {
                continue;
            }

            let Some(reason) = config.breach_reason(&stats) else {
                continue;
            };

            let entry = DisabledEntry {
                channel_id: key.channel_id,
                model: key.model.clone(),
                disabled_at: now,
                reason,
                duration: config.recovery(),
            };
            info!(
                channel_id = key.channel_id,
                model = %key.model,
                reason = %entry.reason,
                recovery = ?entry.duration,
                "Channel temporarily disabled for slow responses"
            );
            self.disabled.insert(key.clone(), entry);
            monitor.mark_disabled(now);
            gateway_metrics::channel_disabled();
            disabled_count += 1;
        }

        if disabled_count > 0 {
            info!(count = disabled_count, "Health scan disabled channel+model pairings");
        }
        disabled_count
    }

    /// Whether the pairing is quarantined right now
    ///
    /// Unmonitored pairings are always available. An entry found past its
    /// expiry is removed on the spot.
    pub fn is_disabled(&self, channel_id: i64, model: &str) -> bool {
        let key = PairingKey::new(channel_id, model);
        if self.config.lookup_enabled(&key).is_none() {
            return false;
        }

        let now = self.clock.now();
        let expired = match self.disabled.get(&key) {
            None => return false,
            Some(entry) => entry.is_expired(now),
        };
        if !expired {
            return true;
        }

        if let Some((_, entry)) = self.disabled.remove_if(&key, |_, entry| entry.is_expired(now)) {
            info!(
                channel_id = entry.channel_id,
                model = %entry.model,
                "Channel quarantine expired, available again"
            );
            gateway_metrics::channel_recovered("expired");
        }
        false
    }

    /// Remove every quarantine entry past its expiry
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut expired = 0;
        self.disabled.retain(|_, entry| {
            if entry.is_expired(now) {
                info!(
                    channel_id = entry.channel_id,
                    model = %entry.model,
                    "Channel quarantine expired, automatically recovered"
                );
                expired += 1;
                false
            } else {
                true
            }
        });

        for _ in 0..expired {
            gateway_metrics::channel_recovered("expired");
        }
        if expired > 0 {
            info!(count = expired, "Recovery sweep re-enabled channel+model pairings");
        }
        expired
    }

    /// Discard monitors that have not seen a sample for `inactive_after`
    pub fn clean_inactive(&self) -> usize {
        let now = self.clock.now();
        let before = self.monitors.len();
        self.monitors
            .retain(|_, monitor| !monitor.is_inactive(now, self.inactive_after));
        let removed = before.saturating_sub(self.monitors.len());

        gateway_metrics::set_monitor_count(self.monitors.len());
        if removed > 0 {
            debug!(count = removed, "Removed inactive channel monitors");
        }
        removed
    }

    /// Manually lift a quarantine
    pub fn recover(&self, channel_id: i64, model: &str) -> Option<DisabledEntry> {
        let key = PairingKey::new(channel_id, model);
        let (_, entry) = self.disabled.remove(&key)?;
        info!(channel_id, model, "Channel quarantine lifted manually");
        gateway_metrics::channel_recovered("manual");
        Some(entry)
    }

    /// Unexpired quarantine entries
    pub fn disabled_entries(&self) -> Vec<DisabledEntry> {
        let now = self.clock.now();
        let mut entries: Vec<DisabledEntry> = self
            .disabled
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| (a.channel_id, &a.model).cmp(&(b.channel_id, &b.model)));
        entries
    }

    pub fn monitor_stats(&self, channel_id: i64, model: &str) -> Option<MonitorSnapshot> {
        let key = PairingKey::new(channel_id, model);
        let now = self.clock.now();
        let monitor = self.monitors.get(&key)?;
        let window_secs = self
            .config
            .lookup_enabled(&key)
            .map_or(MAX_WINDOW_SECONDS, |config| config.effective_window_secs());
        let disabled = self
            .disabled
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone());

        Some(MonitorSnapshot {
            channel_id,
            model: model.to_string(),
            buckets: monitor.bucket_count(),
            window: monitor.window_stats(),
            completed: monitor.completed_window_stats(now, window_secs),
            last_disabled: monitor.last_disabled(),
            disabled,
        })
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    fn in_cooldown(&self, key: &PairingKey, now: DateTime<Utc>) -> bool {
        self.disabled
            .get(key)
            .map_or(false, |entry| !entry.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::health::window::bucket_start;

    const START: i64 = 1_700_000_000; // multiple of 10

    fn setup(doc: &str) -> (HealthMonitor, Arc<ManualClock>) {
        let store = Arc::new(HealthConfigStore::new());
        store.reload_from_str(doc).unwrap();
        let clock = Arc::new(ManualClock::at_unix(START));
        (HealthMonitor::with_clock(store, clock.clone()), clock)
    }

    fn doc() -> &'static str {
        r#"{"gpt-4o": {"7": {"enable": true, "timeout_window": 60, "timeout_frt_time_ms": 1000, "timeout_use_time": 20, "disable_recovery_time": 120}}}"#
    }

    #[test]
    fn test_unmonitored_pairing_is_ignored() {
        let (monitor, _) = setup(doc());
        monitor.record_sample(8, "gpt-4o", Sample::from_raw(50_000, 100.0));
        monitor.record_sample(7, "claude-3", Sample::from_raw(50_000, 100.0));
        assert_eq!(monitor.monitor_count(), 0);
        assert!(!monitor.is_disabled(8, "gpt-4o"));
    }

    #[test]
    fn test_slow_completed_window_disables() {
        let (monitor, clock) = setup(doc());
        for _ in 0..3 {
            monitor.record_sample(7, "gpt-4o", Sample::from_raw(2_000, 5.0));
        }
        clock.advance(Duration::from_secs(10));

        assert_eq!(monitor.evaluate_and_maybe_disable(), 1);
        assert!(monitor.is_disabled(7, "gpt-4o"));

        let entries = monitor.disabled_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].reason.contains("latency"));
        assert_eq!(entries[0].duration, Duration::from_secs(120));

        // Buckets were cleared and a second pass is a no-op during cooldown
        let stats = monitor.monitor_stats(7, "gpt-4o").unwrap();
        assert_eq!(stats.buckets, 0);
        assert_eq!(stats.last_disabled, Some(clock.now()));
        assert_eq!(monitor.evaluate_and_maybe_disable(), 0);
    }

    #[test]
    fn test_open_bucket_never_triggers_disable() {
        let (monitor, clock) = setup(doc());
        clock.advance(Duration::from_secs(3));
        for _ in 0..10 {
            monitor.record_sample(7, "gpt-4o", Sample::from_raw(60_000, 300.0));
        }
        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket_start(clock.now()).timestamp(), START);
        assert_eq!(monitor.evaluate_and_maybe_disable(), 0);
        assert!(!monitor.is_disabled(7, "gpt-4o"));
    }

    #[test]
    fn test_duration_threshold_with_unmeasured_latency() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(-1, 30.0));
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(-1, 25.0));
        clock.advance(Duration::from_secs(10));

        assert_eq!(monitor.evaluate_and_maybe_disable(), 1);
        let entries = monitor.disabled_entries();
        assert!(entries[0].reason.contains("duration"));
    }

    #[test]
    fn test_healthy_window_stays_enabled() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(300, 2.0));
        clock.advance(Duration::from_secs(10));
        assert_eq!(monitor.evaluate_and_maybe_disable(), 0);
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(5_000, 1.0));
        clock.advance(Duration::from_secs(10));
        monitor.evaluate_and_maybe_disable();

        clock.advance(Duration::from_millis(119_999));
        assert!(monitor.is_disabled(7, "gpt-4o"));

        clock.advance(Duration::from_millis(1));
        assert!(!monitor.is_disabled(7, "gpt-4o"));
        assert!(monitor.disabled_entries().is_empty());
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(5_000, 1.0));
        clock.advance(Duration::from_secs(10));
        monitor.evaluate_and_maybe_disable();

        assert_eq!(monitor.sweep_expired(), 0);
        clock.advance(Duration::from_secs(120));
        assert_eq!(monitor.sweep_expired(), 1);
        assert_eq!(monitor.sweep_expired(), 0);
        assert!(!monitor.is_disabled(7, "gpt-4o"));
    }

    #[test]
    fn test_config_removal_makes_pairing_available() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(5_000, 1.0));
        clock.advance(Duration::from_secs(10));
        monitor.evaluate_and_maybe_disable();
        assert!(monitor.is_disabled(7, "gpt-4o"));

        monitor.config().reload_from_str("{}").unwrap();
        assert!(!monitor.is_disabled(7, "gpt-4o"));
    }

    #[test]
    fn test_manual_recover() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(5_000, 1.0));
        clock.advance(Duration::from_secs(10));
        monitor.evaluate_and_maybe_disable();

        assert!(monitor.recover(7, "gpt-4o").is_some());
        assert!(!monitor.is_disabled(7, "gpt-4o"));
        assert!(monitor.recover(7, "gpt-4o").is_none());
    }

    #[test]
    fn test_clean_inactive_monitors() {
        let (monitor, clock) = setup(doc());
        monitor.record_sample(7, "gpt-4o", Sample::from_raw(100, 1.0));
        assert_eq!(monitor.monitor_count(), 1);

        clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(monitor.clean_inactive(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(monitor.clean_inactive(), 1);
        assert_eq!(monitor.monitor_count(), 0);
    }
}
