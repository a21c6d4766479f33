//! Monitoring: Prometheus metrics and structured logging

pub mod metrics;
pub mod tracing;

use std::path::PathBuf;

/// Monitoring configuration shared by the binary and the router.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Path serving the Prometheus text exposition.
    pub prometheus_path: String,
    /// Path serving the health check.
    pub health_path: String,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log format: `json`, `compact`, or `pretty`.
    pub log_format: String,
    /// When set, logs are additionally written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_dir: None,
        }
    }
}
