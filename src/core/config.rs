//! # Configuration Module
//!
//! Process configuration for the gateway, loaded from YAML with environment
//! variable overrides and validated before use.
//!
//! The per-pairing health thresholds are *not* part of this document. They
//! live in a separate JSON document that is hot-reloaded by the health
//! monitor (see [`crate::health::config`]); this file only says where to find
//! it and how often to re-read it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::credential::GroupCatalog;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Admin HTTP server settings
    pub server: ServerConfig,

    /// Shared remote cache; absent means every instance keeps local state only
    pub redis: Option<RedisConfig>,

    /// Channel rate ceiling settings
    pub rate_limit: RateLimitSettings,

    /// Channel health monitor settings
    pub health: HealthSettings,

    /// Credential caching settings
    pub credential: CredentialSettings,

    /// Log output settings
    pub logging: LogConfig,

    /// Metrics exporter settings
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without env overrides or validation
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Recognised variables: `GATEWAY_REDIS_URL`, `GATEWAY_ADMIN_PORT`,
    /// `GATEWAY_LOG_LEVEL`, `GATEWAY_HMAC_SECRET`, `GATEWAY_HEALTH_CONFIG_PATH`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            match self.redis.as_mut() {
                Some(redis) => redis.url = url,
                None => {
                    self.redis = Some(RedisConfig {
                        url,
                        ..RedisConfig::default()
                    })
                }
            }
        }

        if let Ok(port) = env::var("GATEWAY_ADMIN_PORT") {
            self.server.admin_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_ADMIN_PORT: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(secret) = env::var("GATEWAY_HMAC_SECRET") {
            self.credential.hmac_secret = secret;
        }

        if let Ok(path) = env::var("GATEWAY_HEALTH_CONFIG_PATH") {
            self.health.config_path = Some(PathBuf::from(path));
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> GatewayResult<()> {
        let health = &self.health;
        let intervals = [
            ("health.reload_interval", health.reload_interval),
            ("health.scan_interval", health.scan_interval),
            ("health.recovery_interval", health.recovery_interval),
            ("health.cleanup_interval", health.cleanup_interval),
            ("health.inactive_after", health.inactive_after),
            ("rate_limit.window", self.rate_limit.window),
            ("rate_limit.cleanup_interval", self.rate_limit.cleanup_interval),
            ("credential.cache_ttl", self.credential.cache_ttl),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(GatewayError::config(format!("{} must be greater than zero", name)));
            }
        }

        if self.rate_limit.window.as_secs() == 0 {
            return Err(GatewayError::config(
                "rate_limit.window must be at least one second",
            ));
        }

        if self.rate_limit.backend == RateLimitBackendKind::Shared && self.redis.is_none() {
            return Err(GatewayError::config(
                "rate_limit.backend is 'shared' but no redis section is configured",
            ));
        }

        if let Some(redis) = &self.redis {
            if redis.url.is_empty() {
                return Err(GatewayError::config("redis.url must not be empty"));
            }
            if redis.timeout.is_zero() {
                return Err(GatewayError::config("redis.timeout must be greater than zero"));
            }
            if self.credential.hmac_secret.is_empty() {
                return Err(GatewayError::config(
                    "credential.hmac_secret is required when redis is configured",
                ));
            }
        }

        if let Some(raw) = &self.credential.usable_groups {
            GroupCatalog::parse(raw).map_err(|e| {
                GatewayError::config(format!("credential.usable_groups: {}", e))
            })?;
        }

        if health.config_path.is_some() && health.inline.is_some() {
            return Err(GatewayError::config(
                "health.config_path and health.inline are mutually exclusive",
            ));
        }

        Ok(())
    }

    /// Whether the shared backend should serve rate limiting
    pub fn use_shared_rate_limit(&self) -> bool {
        match self.rate_limit.backend {
            RateLimitBackendKind::Local => false,
            RateLimitBackendKind::Shared => true,
            RateLimitBackendKind::Auto => self.redis.is_some(),
        }
    }
}

/// Admin HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            admin_port: 8081,
        }
    }
}

/// Shared remote cache connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,

    /// Client-side deadline applied to every round trip
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Prefix prepended to every key written by this gateway
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            timeout: Duration::from_millis(500),
            key_prefix: String::new(),
        }
    }
}

/// Which rate-limit backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackendKind {
    Local,
    Shared,
    /// Shared when redis is configured, local otherwise
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub backend: RateLimitBackendKind,

    /// Window the per-channel ceilings are expressed in
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// How often expired local windows are purged
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            backend: RateLimitBackendKind::Auto,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Health monitor scheduling and config source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// JSON file holding the model -> channel -> thresholds document
    pub config_path: Option<PathBuf>,

    /// The same document inline, for static deployments and tests
    pub inline: Option<String>,

    #[serde(with = "humantime_serde")]
    pub reload_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Monitors whose newest bucket is older than this are discarded
    #[serde(with = "humantime_serde")]
    pub inactive_after: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            inline: None,
            reload_interval: Duration::from_secs(60),
            scan_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(600),
            inactive_after: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Key for the keyed hash that addresses cached credentials
    pub hmac_secret: String,

    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Initial group catalog as JSON; the built-in catalog when absent
    pub usable_groups: Option<String>,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            hmac_secret: String::new(),
            cache_ttl: Duration::from_secs(600),
            usable_groups: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Port for the Prometheus scrape endpoint; disabled when unset
    pub metrics_port: Option<u16>,
}
