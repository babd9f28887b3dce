//! Prometheus metrics for the cetasense server.
//!
//! Recording goes through the `metrics` facade. [`Metrics`] carries the
//! Prometheus handle used to render `/metrics`; components receive it by
//! value instead of reaching for a global. A [`Metrics::noop`] handle records
//! into whatever recorder is installed (none in tests) and renders nothing.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// The recorder is process-global; remember the handle so a second
/// `install` reuses it.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    // Response cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_INVALIDATED_KEYS_TOTAL: &str = "cache_invalidated_keys_total";

    // Job metrics
    pub const JOBS_DISPATCHED_TOTAL: &str = "jobs_dispatched_total";
    pub const JOBS_DISPATCH_FAILED_TOTAL: &str = "jobs_dispatch_failed_total";

    // Status stream metrics
    pub const STATUS_STREAMS_ACTIVE: &str = "status_streams_active";
    pub const STATUS_STREAMS_CLOSED_TOTAL: &str = "status_streams_closed_total";

    // Per-step timings
    pub const STEP_DURATION_SECONDS: &str = "step_duration_seconds";
}

#[derive(Clone, Default)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the Prometheus recorder, or reuse it if this process already did.
    pub fn install() -> Self {
        if let Some(handle) = PROMETHEUS_HANDLE.get() {
            return Self {
                handle: Some(handle.clone()),
            };
        }

        // Pull-based: /metrics is served by our own router.
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();
                tracing::info!("Prometheus metrics initialized");
                Self {
                    handle: Some(handle),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Prometheus recorder");
                Self::noop()
            }
        }
    }

    pub fn noop() -> Self {
        Self { handle: None }
    }

    /// Prometheus text format, or `None` when no recorder was installed.
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.render())
    }

    /// `route` must be a route template or a fixed label, never a raw path.
    pub fn http_request(&self, method: &str, route: &str, status: u16, duration: Duration) {
        counter!(
            names::HTTP_REQUESTS_TOTAL,
            "method" => method.to_string(),
            "path" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            names::HTTP_REQUEST_DURATION_SECONDS,
            "method" => method.to_string(),
            "path" => route.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn cache_hit(&self) {
        counter!(names::CACHE_HITS_TOTAL).increment(1);
    }

    pub fn cache_miss(&self) {
        counter!(names::CACHE_MISSES_TOTAL).increment(1);
    }

    pub fn cache_error(&self, op: &'static str) {
        counter!(names::CACHE_ERRORS_TOTAL, "op" => op).increment(1);
    }

    pub fn cache_invalidated(&self, keys: usize) {
        counter!(names::CACHE_INVALIDATED_KEYS_TOTAL).increment(keys as u64);
    }

    pub fn job_dispatched(&self) {
        counter!(names::JOBS_DISPATCHED_TOTAL).increment(1);
    }

    pub fn job_dispatch_failed(&self) {
        counter!(names::JOBS_DISPATCH_FAILED_TOTAL).increment(1);
    }

    pub fn stream_opened(&self) {
        gauge!(names::STATUS_STREAMS_ACTIVE).increment(1.0);
    }

    pub fn stream_closed(&self, outcome: &'static str) {
        gauge!(names::STATUS_STREAMS_ACTIVE).decrement(1.0);
        counter!(names::STATUS_STREAMS_CLOSED_TOTAL, "outcome" => outcome).increment(1);
    }

    /// Start timing a named step; the duration is recorded when the guard drops.
    pub fn step(&self, name: &'static str) -> StepTimer {
        StepTimer {
            name,
            started: Instant::now(),
        }
    }
}

pub struct StepTimer {
    name: &'static str,
    started: Instant,
}

impl StepTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        histogram!(names::STEP_DURATION_SECONDS, "step" => self.name).record(elapsed.as_secs_f64());
        tracing::trace!(step = self.name, elapsed_ms = elapsed.as_millis() as u64, "step finished");
    }
}
