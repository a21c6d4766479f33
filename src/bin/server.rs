use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use gpu_inference_server::model::{LoadedModel, ModelConfig};
use gpu_inference_server::monitoring::metrics::Telemetry;
use gpu_inference_server::monitoring::{tracing::init_tracing, MonitoringConfig};
use gpu_inference_server::{InferenceServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "gpu-inference-server")]
#[command(about = "GPU image-classification inference server with Prometheus metrics")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Path to local safetensors weights (fetched from the hub if omitted)
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Hugging Face repo to fetch weights from
    #[arg(long, default_value = "timm/resnet18.a1_in1k")]
    hub_repo: String,

    /// Timeout for remote image fetches, in seconds
    #[arg(long, default_value = "10")]
    fetch_timeout_secs: u64,

    /// Synthetic accelerator-load iterations per request
    #[arg(long, default_value = "10")]
    synthetic_load_iters: usize,

    /// Path for the Prometheus exposition endpoint
    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    /// Path for the health endpoint
    #[arg(long, default_value = "/health")]
    health_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Directory for rolling file logs (console only if omitted)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let monitoring = MonitoringConfig {
        prometheus_path: args.metrics_path.clone(),
        health_path: args.health_path.clone(),
        log_level: args.log_level.clone(),
        log_format: args.log_format.clone(),
        log_dir: args.log_dir.clone(),
    };

    let _guard = init_tracing(&monitoring)?;
    let telemetry = Telemetry::install()?;

    let model_config = ModelConfig {
        weights_path: args.model_path.clone(),
        hub_repo: args.hub_repo.clone(),
        synthetic_load_iters: args.synthetic_load_iters,
        ..ModelConfig::default()
    };

    // Load before binding the listener: a server that cannot serve
    // predictions must not come up.
    info!("loading model");
    let model = tokio::task::spawn_blocking(move || LoadedModel::load(&model_config))
        .await
        .context("model load task panicked")?
        .context("failed to load model")?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        fetch_timeout: Duration::from_secs(args.fetch_timeout_secs),
        monitoring,
    };

    let server = InferenceServer::new(config, Some(Arc::new(model)), telemetry)?;
    server.serve().await
}
