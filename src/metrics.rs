//! Prometheus metrics for PartKeeper.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "partkeeper_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "partkeeper_http_request_duration_seconds";

/// Total coordinator operations (counter). Labels: operation, status.
pub const MULTIPART_OPERATIONS_TOTAL: &str = "partkeeper_multipart_operations_total";

/// Total part payload bytes accepted by the remote store (counter).
pub const PART_BYTES_RECEIVED_TOTAL: &str = "partkeeper_part_bytes_received_total";

/// Remote uploads left without a local session (counter). Labels: compensated.
pub const ORPHANED_UPLOADS_TOTAL: &str = "partkeeper_orphaned_uploads_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        MULTIPART_OPERATIONS_TOTAL,
        "Total multipart operations by type and outcome"
    );
    describe_counter!(
        PART_BYTES_RECEIVED_TOTAL,
        "Total part bytes accepted by the remote store"
    );
    describe_counter!(
        ORPHANED_UPLOADS_TOTAL,
        "Remote uploads whose local session could not be recorded"
    );
}

/// Count one coordinator operation outcome.
pub fn record_operation(operation: &'static str, status: &'static str) {
    counter!(MULTIPART_OPERATIONS_TOTAL, "operation" => operation, "status" => status)
        .increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a bounded label value.
///
/// Known routes keep their path; anything else collapses to `other` so
/// probing clients cannot inflate label cardinality.
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/openapi.json" | "/metrics" | "/multipart/init"
        | "/multipart/upload_part" | "/multipart/complete" | "/multipart/abort"
        | "/multipart/parts" => path.to_string(),
        _ => "other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_known_routes() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
        assert_eq!(normalize_path("/multipart/init"), "/multipart/init");
        assert_eq!(normalize_path("/multipart/parts"), "/multipart/parts");
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/"), "other");
        assert_eq!(normalize_path("/multipart/../etc"), "other");
        assert_eq!(normalize_path("/random/path/here"), "other");
    }
}
