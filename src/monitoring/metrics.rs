//! Metric registration, exposition, and per-request tracking
//!
//! Metric names are part of the monitoring contract; renaming any of them
//! breaks downstream dashboards and alerts.

use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Total inference requests, labeled by (endpoint, method, status).
pub const REQUESTS_TOTAL: &str = "gpu_inference_requests_total";
/// Request latency in seconds, labeled by endpoint.
pub const REQUEST_DURATION_SECONDS: &str = "gpu_inference_request_duration_seconds";
/// Time taken to load the model; observed exactly once at startup.
pub const MODEL_LOAD_SECONDS: &str = "gpu_model_load_duration_seconds";
/// Number of currently active inference requests.
pub const ACTIVE_REQUESTS: &str = "gpu_inference_active_requests";
/// Whether the model is loaded (1) or not (0).
pub const MODEL_LOADED: &str = "gpu_model_loaded";

const DURATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const LOAD_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

/// Handle to the process-wide Prometheus recorder.
///
/// Cheap to clone; `render` serializes the current value of every registered
/// metric without blocking request processing.
#[derive(Clone)]
pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder.
    ///
    /// Idempotent: the first caller installs, later callers get a handle to
    /// the same registry. Fails only if a foreign recorder is already set.
    pub fn install() -> Result<Self> {
        let _install = INSTALL
            .lock()
            .map_err(|_| anyhow!("recorder install lock poisoned"))?;
        if let Some(handle) = HANDLE.get() {
            return Ok(Self { handle: handle.clone() });
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
                DURATION_BUCKETS,
            )
            .map_err(|e| anyhow!("invalid duration buckets: {e}"))?
            .set_buckets_for_metric(Matcher::Full(MODEL_LOAD_SECONDS.to_string()), LOAD_BUCKETS)
            .map_err(|e| anyhow!("invalid load buckets: {e}"))?
            .build_recorder();
        let handle = recorder.handle();

        // Publish the handle only once the global macros are wired to this
        // registry; a failed install must not leave a dangling handle.
        metrics::set_global_recorder(recorder)
            .map_err(|_| anyhow!("a metrics recorder is already installed"))?;
        let _ = HANDLE.set(handle.clone());
        describe_metrics();
        gauge!(MODEL_LOADED).set(0.0);
        gauge!(ACTIVE_REQUESTS).set(0.0);
        Ok(Self { handle })
    }

    /// Serialize all registered metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Begin tracking a request; see [`RequestTracker`].
    pub fn track_request(&self, endpoint: &str, method: &str) -> RequestTracker {
        RequestTracker::new(endpoint, method)
    }
}

fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Total number of inference requests");
    describe_histogram!(REQUEST_DURATION_SECONDS, Unit::Seconds, "Request latency in seconds");
    describe_histogram!(MODEL_LOAD_SECONDS, Unit::Seconds, "Time taken to load the model");
    describe_gauge!(ACTIVE_REQUESTS, "Number of currently active inference requests");
    describe_gauge!(MODEL_LOADED, "Whether the model is loaded (1) or not (0)");
}

/// Record the one-shot model load observation and flip the readiness gauge.
///
/// Called exactly once at startup, only after the load succeeded.
pub fn record_model_load(duration: Duration) {
    histogram!(MODEL_LOAD_SECONDS).record(duration.as_secs_f64());
    gauge!(MODEL_LOADED).set(1.0);
}

/// Scoped telemetry for a single request.
///
/// Construction increments the in-flight gauge. Dropping the tracker, on any
/// control path including panics, records exactly one request-count
/// increment, exactly one latency observation, and the paired gauge
/// decrement. Call [`RequestTracker::finish`] with the terminal status before
/// the tracker goes out of scope; an unfinished tracker counts as a 500.
pub struct RequestTracker {
    endpoint: String,
    method: String,
    start: Instant,
    status: Option<u16>,
}

impl RequestTracker {
    fn new(endpoint: &str, method: &str) -> Self {
        gauge!(ACTIVE_REQUESTS).increment(1.0);
        Self {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            start: Instant::now(),
            status: None,
        }
    }

    /// Record the terminal HTTP status and consume the tracker.
    pub fn finish(mut self, status: StatusCode) {
        self.status = Some(status.as_u16());
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        let status = self.status.unwrap_or(500);
        counter!(
            REQUESTS_TOTAL,
            "endpoint" => self.endpoint.clone(),
            "method" => self.method.clone(),
            "status" => status.to_string(),
        )
        .increment(1);
        histogram!(REQUEST_DURATION_SECONDS, "endpoint" => self.endpoint.clone())
            .record(self.start.elapsed().as_secs_f64());
        gauge!(ACTIVE_REQUESTS).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        let first = Telemetry::install().expect("first install");
        let second = Telemetry::install().expect("second install");
        // Both handles render from the same registry.
        first.render();
        second.render();
    }

    /// The returned handle must render what the global macros record.
    #[test]
    fn handle_is_wired_to_the_global_recorder() {
        let telemetry = Telemetry::install().expect("install");
        counter!("telemetry_linkage_checks_total").increment(1);
        assert!(telemetry.render().contains("telemetry_linkage_checks_total"));
    }

    #[test]
    fn tracker_records_on_every_path() {
        let telemetry = Telemetry::install().expect("install");

        let tracker = telemetry.track_request("/unit-finish", "POST");
        tracker.finish(StatusCode::OK);

        // Dropped without finish: still recorded, as a 500.
        let tracker = telemetry.track_request("/unit-drop", "POST");
        drop(tracker);

        let rendered = telemetry.render();
        assert!(rendered.contains(r#"endpoint="/unit-finish",method="POST",status="200""#));
        assert!(rendered.contains(r#"endpoint="/unit-drop",method="POST",status="500""#));
    }
}
