//! HTTP image-classification inference server with Prometheus monitoring
//!
//! The server loads a pretrained classifier once at startup (GPU when
//! available, CPU otherwise), then serves `/predict` (multipart upload or
//! JSON `image_url`), `/health`, and `/metrics`. Every request passes
//! through a telemetry guard that records exactly one counter increment and
//! one latency observation per terminal outcome.

pub mod acquire;
pub mod error;
pub mod infer;
pub mod model;
pub mod monitoring;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use acquire::{ImageSource, UrlFetcher};
use error::{PredictError, ValidationError};
use infer::PredictionResult;
use model::LoadedModel;
use monitoring::metrics::Telemetry;
use monitoring::MonitoringConfig;

/// Upper bound on request bodies, uploads included.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bound on remote image fetches; no retry on expiry.
    pub fetch_timeout: Duration,
    pub monitoring: MonitoringConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            fetch_timeout: Duration::from_secs(10),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Shared state: the immutable model (when loaded), the fetch client, and
/// the telemetry handle. Cloned per request, never mutated after startup.
#[derive(Clone)]
pub struct AppState {
    model: Option<Arc<LoadedModel>>,
    fetcher: Arc<UrlFetcher>,
    telemetry: Telemetry,
}

impl AppState {
    pub fn new(
        model: Option<Arc<LoadedModel>>,
        fetcher: Arc<UrlFetcher>,
        telemetry: Telemetry,
    ) -> Self {
        Self { model, fetcher, telemetry }
    }
}

/// The inference server: owns config and state, builds the router, serves.
pub struct InferenceServer {
    config: ServerConfig,
    state: AppState,
}

impl InferenceServer {
    pub fn new(
        config: ServerConfig,
        model: Option<Arc<LoadedModel>>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let fetcher = Arc::new(UrlFetcher::new(config.fetch_timeout)?);
        Ok(Self { state: AppState::new(model, fetcher, telemetry), config })
    }

    pub fn create_app(&self) -> Router {
        create_app(self.state.clone(), &self.config.monitoring)
    }

    /// Bind and serve until SIGINT/SIGTERM.
    pub async fn serve(&self) -> Result<()> {
        let app = self.create_app();
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(addr = %addr, "starting inference server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

/// Build the application router with all routes and middleware.
pub fn create_app(state: AppState, monitoring: &MonitoringConfig) -> Router {
    Router::new()
        .route(&monitoring.health_path, get(health_handler))
        .route("/predict", post(predict_handler))
        .route(&monitoring.prometheus_path, get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check: never fails, reports whether the model is loaded.
async fn health_handler(State(state): State<AppState>) -> Response {
    let tracker = state.telemetry.track_request("/health", "GET");
    let body = Json(json!({
        "status": "healthy",
        "model_loaded": state.model.is_some(),
    }));
    tracker.finish(StatusCode::OK);
    (StatusCode::OK, body).into_response()
}

/// Prometheus text exposition. Reads the atomic registry; never blocks
/// in-flight request processing. Not itself tracked.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct UrlPayload {
    image_url: Option<String>,
}

/// Main prediction endpoint.
///
/// The tracker wraps the whole pipeline: every terminal branch below passes
/// through `finish`, and the tracker's drop guard covers anything that
/// doesn't.
async fn predict_handler(State(state): State<AppState>, request: Request) -> Response {
    let tracker = state.telemetry.track_request("/predict", request.method().as_str());
    let request_id = uuid::Uuid::new_v4();

    let response = match handle_predict(&state, request).await {
        Ok(prediction) => {
            info!(
                request_id = %request_id,
                predicted_class = prediction.predicted_class,
                confidence = prediction.confidence,
                device = %prediction.device_used,
                "prediction completed"
            );
            (StatusCode::OK, Json(prediction)).into_response()
        }
        Err(err) => {
            match &err {
                PredictError::Validation(reason) => {
                    warn!(request_id = %request_id, %reason, "rejected predict request");
                }
                PredictError::NotReady => {
                    error!(request_id = %request_id, "predict called before model load");
                }
                PredictError::Internal(detail) => {
                    error!(request_id = %request_id, detail = %detail, "inference failed");
                }
            }
            err.into_response()
        }
    };

    tracker.finish(response.status());
    response
}

async fn handle_predict(
    state: &AppState,
    request: Request,
) -> Result<PredictionResult, PredictError> {
    let model = state.model.clone().ok_or(PredictError::NotReady)?;

    let source = image_source_from_request(request).await?;
    let image = source
        .acquire(state.fetcher.as_ref())
        .await
        .map_err(PredictError::Validation)?;

    // The pipeline is CPU/GPU-bound and fully synchronous; run it off the
    // async workers.
    tokio::task::spawn_blocking(move || infer::run(&image, &model))
        .await
        .map_err(|e| PredictError::Internal(anyhow::anyhow!(e)))?
        .map_err(PredictError::Internal)
}

/// Select the image-source variant from the request shape: multipart bodies
/// carry an upload, anything else must be a JSON `image_url` payload.
async fn image_source_from_request(request: Request) -> Result<ImageSource, PredictError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ValidationError::InvalidMultipart(e.to_string()))?;
        return Ok(ImageSource::Upload(multipart));
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| PredictError::Internal(anyhow::anyhow!(e)))?;
    let payload: UrlPayload =
        serde_json::from_slice(&bytes).map_err(|_| ValidationError::MissingField)?;
    let url = payload.image_url.ok_or(ValidationError::MissingField)?;
    Ok(ImageSource::RemoteUrl(url))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
