//! # Channel Health Monitor
//!
//! Circuit breaker for upstream (channel, model) pairings. Completed calls
//! report first-response latency and total duration; samples are folded into
//! 10-second buckets and a periodic scan compares the completed part of each
//! pairing's window with its configured thresholds. A pairing that trips is
//! quarantined for its recovery time and then comes back on its own.
//!
//! ## Background tasks
//! Four independent loops, sharing nothing but the registries:
//! - config reload (default every 60s)
//! - disable scan (every 5s)
//! - recovery sweep (every 10s)
//! - inactive monitor cleanup (every 10min)

pub mod config;
mod monitor;
mod window;

pub use config::{
    ChannelModelHealthConfig, FileConfigSource, HealthConfigDocument, HealthConfigSource,
    HealthConfigStore, StaticConfigSource,
};
pub use monitor::{DisabledEntry, HealthMonitor, MonitorSnapshot};
pub use window::{
    bucket_start, ChannelHealthMonitor, IntervalBucket, Sample, WindowStats, BUCKET_SECONDS,
    MAX_BUCKETS, MAX_WINDOW_SECONDS,
};

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config::HealthSettings;
use crate::core::tasks::spawn_periodic;

/// Identity of a monitored (channel, model) pairing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PairingKey {
    pub channel_id: i64,
    pub model: String,
}

impl PairingKey {
    pub fn new(channel_id: i64, model: impl Into<String>) -> Self {
        Self {
            channel_id,
            model: model.into(),
        }
    }
}

impl fmt::Display for PairingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.model)
    }
}

impl HealthMonitor {
    /// Start the reload, scan, recovery and cleanup loops
    ///
    /// Every loop stops when `cancel` fires.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        source: Arc<dyn HealthConfigSource>,
        settings: &HealthSettings,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let reloader = Arc::clone(self);
        let reload = spawn_periodic(
            "health-config-reload",
            settings.reload_interval,
            cancel.clone(),
            move || {
                let monitor = Arc::clone(&reloader);
                let source = Arc::clone(&source);
                async move {
                    monitor.reload_config(source.as_ref()).await;
                }
            },
        );

        let scanner = Arc::clone(self);
        let scan = spawn_periodic(
            "health-disable-scan",
            settings.scan_interval,
            cancel.clone(),
            move || {
                scanner.evaluate_and_maybe_disable();
                async {}
            },
        );

        let sweeper = Arc::clone(self);
        let recovery = spawn_periodic(
            "health-recovery-sweep",
            settings.recovery_interval,
            cancel.clone(),
            move || {
                sweeper.sweep_expired();
                async {}
            },
        );

        let cleaner = Arc::clone(self);
        let cleanup = spawn_periodic(
            "health-monitor-cleanup",
            settings.cleanup_interval,
            cancel,
            move || {
                cleaner.clean_inactive();
                async {}
            },
        );

        tracing::info!("Channel health monitor background tasks started");
        vec![reload, scan, recovery, cleanup]
    }
}
