//! Structured logging configuration

use std::io;

use anyhow::Result;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use super::MonitoringConfig;

/// Guard that keeps the non-blocking file writer flushing until process exit.
pub struct TracingGuard {
    _file_guard: Option<non_blocking::WorkerGuard>,
}

/// Initialize the tracing subscriber from config.
///
/// `RUST_LOG` overrides the configured level. When `log_dir` is set, log
/// lines are additionally written to a daily-rolling file without ANSI codes.
pub fn init_tracing(config: &MonitoringConfig) -> Result<TracingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer: Box<dyn Layer<Registry> + Send + Sync> =
        match config.log_format.as_str() {
            "json" => fmt::layer().json().with_writer(io::stdout).boxed(),
            "compact" => fmt::layer().compact().with_writer(io::stdout).boxed(),
            _ => fmt::layer().pretty().with_writer(io::stdout).boxed(),
        };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(env_filter.boxed());
    layers.push(console_layer);

    let file_guard = match &config.log_dir {
        Some(dir) => {
            let appender = rolling::daily(dir, "gpu-inference-server.log");
            let (writer, guard) = non_blocking(appender);
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).try_init()?;

    Ok(TracingGuard { _file_guard: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one subscriber can be installed per process, so file logging is
    // covered in a single test.
    #[test]
    fn file_logging_creates_a_rolling_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = MonitoringConfig {
            log_format: "json".to_string(),
            log_dir: Some(dir.path().to_path_buf()),
            ..MonitoringConfig::default()
        };

        let guard = init_tracing(&config).expect("init");
        tracing::info!("file logging smoke line");
        drop(guard);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read log dir")
            .collect();
        assert!(!entries.is_empty(), "expected a rolling log file");
    }
}
