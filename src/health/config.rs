//! Per-pairing health thresholds and their hot-reloadable store.
//!
//! The document is JSON keyed by model name, then by channel id (as a
//! string):
//!
//! ```json
//! {
//!   "gpt-4o": {
//!     "12": {
//!       "enable": true,
//!       "timeout_window": 60,
//!       "timeout_frt_time_ms": 8000,
//!       "timeout_use_time": 45,
//!       "disable_recovery_time": 300
//!     }
//!   }
//! }
//! ```
//!
//! A pairing that is absent, disabled, or whose entry does not parse is
//! simply not monitored. A document that does not parse at all leaves the
//! previous document in effect.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::window::{WindowStats, BUCKET_SECONDS, MAX_BUCKETS, MAX_WINDOW_SECONDS};
use super::PairingKey;
use crate::core::error::{GatewayError, GatewayResult};

/// Thresholds for one (model, channel) pairing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelModelHealthConfig {
    #[serde(alias = "enabled")]
    pub enable: bool,

    /// Length of the evaluated window, in seconds
    #[serde(rename = "timeout_window")]
    pub window_secs: i64,

    /// Mean first-response latency ceiling, in milliseconds
    #[serde(rename = "timeout_frt_time_ms")]
    pub latency_threshold_ms: i64,

    /// Mean full-call duration ceiling, in seconds
    #[serde(rename = "timeout_use_time")]
    pub duration_threshold_secs: i64,

    /// How long a tripped pairing stays quarantined, in seconds
    #[serde(rename = "disable_recovery_time")]
    pub recovery_secs: i64,
}

impl ChannelModelHealthConfig {
    /// Window length clamped to whole buckets between 10 and 300 seconds
    pub fn effective_window_secs(&self) -> i64 {
        self.window_secs.clamp(BUCKET_SECONDS, MAX_WINDOW_SECONDS)
    }

    /// Number of buckets the window spans, rounded up
    pub fn bucket_capacity(&self) -> usize {
        let window = self.effective_window_secs();
        let buckets = (window + BUCKET_SECONDS - 1) / BUCKET_SECONDS;
        (buckets as usize).clamp(1, MAX_BUCKETS)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_secs(self.recovery_secs.max(0) as u64)
    }

    /// Whether evaluation may disable this pairing at all
    pub fn can_disable(&self) -> bool {
        self.enable
            && self.recovery_secs > 0
            && (self.latency_threshold_ms > 0 || self.duration_threshold_secs > 0)
    }

    /// Why the completed window breaches a threshold, if it does
    ///
    /// Latency is only judged when at least one sample carried a latency.
    /// A threshold of zero leaves that dimension unchecked.
    pub fn breach_reason(&self, stats: &WindowStats) -> Option<String> {
        if self.latency_threshold_ms > 0
            && stats.latency_samples > 0
            && stats.avg_latency_ms > self.latency_threshold_ms as f64
        {
            return Some(format!(
                "average first-response latency {:.0}ms exceeds {}ms",
                stats.avg_latency_ms, self.latency_threshold_ms
            ));
        }

        if self.duration_threshold_secs > 0
            && stats.avg_duration_secs > self.duration_threshold_secs as f64
        {
            return Some(format!(
                "average call duration {:.2}s exceeds {}s",
                stats.avg_duration_secs, self.duration_threshold_secs
            ));
        }

        None
    }
}

/// Parsed document: model name -> channel id -> thresholds
#[derive(Debug, Clone, Default)]
pub struct HealthConfigDocument {
    pairings: HashMap<String, HashMap<i64, ChannelModelHealthConfig>>,
}

impl HealthConfigDocument {
    /// Parse the JSON document
    ///
    /// Fails only when the document as a whole is not a model -> channel
    /// object. Individual entries that do not parse are skipped with a
    /// warning.
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let loose: HashMap<String, HashMap<String, serde_json::Value>> = serde_json::from_str(raw)
            .map_err(|e| GatewayError::config(format!("Invalid channel health config: {}", e)))?;

        let mut pairings: HashMap<String, HashMap<i64, ChannelModelHealthConfig>> = HashMap::new();
        for (model, channels) in loose {
            for (channel, value) in channels {
                let channel_id = match channel.trim().parse::<i64>() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(model = %model, channel = %channel, "Skipping health config entry with non-numeric channel id");
                        continue;
                    }
                };
                match serde_json::from_value::<ChannelModelHealthConfig>(value) {
                    Ok(config) => {
                        pairings.entry(model.clone()).or_default().insert(channel_id, config);
                    }
                    Err(e) => {
                        warn!(model = %model, channel_id, error = %e, "Skipping malformed health config entry");
                    }
                }
            }
        }

        Ok(Self { pairings })
    }

    pub fn get(&self, key: &PairingKey) -> Option<&ChannelModelHealthConfig> {
        self.pairings.get(&key.model)?.get(&key.channel_id)
    }

    pub fn any_enabled(&self) -> bool {
        self.pairings
            .values()
            .flat_map(|channels| channels.values())
            .any(|config| config.enable)
    }

    pub fn pairing_count(&self) -> usize {
        self.pairings.values().map(HashMap::len).sum()
    }
}

/// Holder of the current document
///
/// Readers clone an `Arc` under a short read lock, so a reload swaps the
/// whole document at once and nobody observes a half-applied update.
#[derive(Debug, Default)]
pub struct HealthConfigStore {
    current: RwLock<Arc<HealthConfigDocument>>,
}

impl HealthConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: HealthConfigDocument) -> Self {
        Self {
            current: RwLock::new(Arc::new(document)),
        }
    }

    pub fn snapshot(&self) -> Arc<HealthConfigDocument> {
        Arc::clone(&self.current.read())
    }

    /// Replace the document from raw JSON, keeping the old one on parse failure
    pub fn reload_from_str(&self, raw: &str) -> GatewayResult<usize> {
        let document = HealthConfigDocument::parse(raw)?;
        let count = document.pairing_count();
        *self.current.write() = Arc::new(document);
        Ok(count)
    }

    /// Thresholds for a pairing whose monitoring is enabled
    pub fn lookup_enabled(&self, key: &PairingKey) -> Option<ChannelModelHealthConfig> {
        self.snapshot().get(key).filter(|config| config.enable).cloned()
    }

    pub fn any_enabled(&self) -> bool {
        self.snapshot().any_enabled()
    }
}

/// Where the health document is read from on each reload
#[async_trait]
pub trait HealthConfigSource: Send + Sync {
    async fn fetch(&self) -> GatewayResult<String>;

    fn describe(&self) -> String;
}

/// Document kept in a JSON file on disk
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HealthConfigSource for FileConfigSource {
    async fn fetch(&self) -> GatewayResult<String> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read channel health config {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Fixed document, for static deployments and tests
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    raw: String,
}

impl StaticConfigSource {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

#[async_trait]
impl HealthConfigSource for StaticConfigSource {
    async fn fetch(&self) -> GatewayResult<String> {
        Ok(self.raw.clone())
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

/// Fetch from `source` and swap the store's document
///
/// Any failure, whether reading or parsing, is logged and leaves the last
/// good document in effect.
pub async fn reload_from_source(store: &HealthConfigStore, source: &dyn HealthConfigSource) -> bool {
    let raw = match source.fetch().await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(source = %source.describe(), error = %e, "Keeping previous channel health config");
            return false;
        }
    };

    match store.reload_from_str(&raw) {
        Ok(count) => {
            info!(source = %source.describe(), pairings = count, "Channel health config loaded");
            true
        }
        Err(e) => {
            tracing::error!(source = %source.describe(), error = %e, "Keeping previous channel health config");
            false
        }
    }
}
