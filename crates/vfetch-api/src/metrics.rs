//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "vfetch_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vfetch_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vfetch_http_requests_in_flight";

    pub const RESULTS_STREAMED_TOTAL: &str = "vfetch_results_streamed_total";
    pub const RESULT_BYTES_TOTAL: &str = "vfetch_result_bytes_total";

    pub const RATE_LIMIT_HITS_TOTAL: &str = "vfetch_rate_limit_hits_total";
}

static JOB_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/jobs/[^/]+").unwrap());

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a result handed to a client.
pub fn record_result_streamed(content_type: &str, size_bytes: u64) {
    let labels = [("content_type", content_type.to_string())];
    counter!(names::RESULTS_STREAMED_TOTAL, &labels).increment(1);
    counter!(names::RESULT_BYTES_TOTAL, &labels).increment(size_bytes);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Collapse job ids so label cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    JOB_PATH.replace(path, "/jobs/:job_id").into_owned()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    // Measures time to first byte; streamed bodies continue after this.
    record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}
