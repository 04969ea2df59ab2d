//! # Admission Metrics
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line and
//! metric names live in one place. Without an installed recorder every call
//! is a no-op, which is what unit tests rely on.
//!
//! | Metric | Kind | Labels |
//! |---|---|---|
//! | `gateway_admission_total` | counter | `outcome` |
//! | `gateway_channel_disabled_total` | counter | |
//! | `gateway_channel_recovered_total` | counter | `trigger` |
//! | `gateway_credential_migrations_total` | counter | |
//! | `gateway_channel_monitors` | gauge | |

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::core::error::{GatewayError, GatewayResult};

pub const ADMISSION_TOTAL: &str = "gateway_admission_total";
pub const CHANNEL_DISABLED_TOTAL: &str = "gateway_channel_disabled_total";
pub const CHANNEL_RECOVERED_TOTAL: &str = "gateway_channel_recovered_total";
pub const CREDENTIAL_MIGRATIONS_TOTAL: &str = "gateway_credential_migrations_total";
pub const CHANNEL_MONITORS: &str = "gateway_channel_monitors";

/// Install the Prometheus recorder with its own scrape listener
///
/// Must be called from inside a tokio runtime.
pub fn install_prometheus_exporter(addr: SocketAddr) -> GatewayResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GatewayError::internal(format!("Failed to install Prometheus exporter: {}", e)))
}

/// Count one admission decision; `outcome` is `allow`, a reject reason code,
/// or `check_failed`
pub fn admission(outcome: &'static str) {
    metrics::counter!(ADMISSION_TOTAL, "outcome" => outcome).increment(1);
}

pub fn channel_disabled() {
    metrics::counter!(CHANNEL_DISABLED_TOTAL).increment(1);
}

/// `trigger` is `expired` or `manual`
pub fn channel_recovered(trigger: &'static str) {
    metrics::counter!(CHANNEL_RECOVERED_TOTAL, "trigger" => trigger).increment(1);
}

pub fn credential_migrated() {
    metrics::counter!(CREDENTIAL_MIGRATIONS_TOTAL).increment(1);
}

pub fn set_monitor_count(count: usize) {
    metrics::gauge!(CHANNEL_MONITORS).set(count as f64);
}
