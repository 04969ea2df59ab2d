// Structured logging
pub mod logging;

// Admission metrics and the Prometheus exporter
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::install_prometheus_exporter;
