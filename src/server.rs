//! Axum router construction.
//!
//! The [`app`] function wires the multipart endpoints and the
//! operational endpoints (`/health`, `/metrics`, `/openapi.json`) to
//! their handlers and returns a ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, REQUEST_ID_HEADER};
use crate::handlers::multipart;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI document ---------------------------------------------------------

/// OpenAPI documentation for the PartKeeper API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "PartKeeper Multipart Upload API",
        version = "0.1.0",
        description = "Resumable multipart uploads in front of an S3-compatible store"
    ),
    paths(
        health_check,
        crate::handlers::multipart::init_upload,
        crate::handlers::multipart::upload_part,
        crate::handlers::multipart::complete_upload,
        crate::handlers::multipart::abort_upload,
        crate::handlers::multipart::list_parts,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Multipart", description = "Multipart upload operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every route.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json))
        .route("/multipart/init", post(multipart::init_upload))
        .route("/multipart/upload_part", post(multipart::upload_part))
        .route("/multipart/complete", post(multipart::complete_upload))
        .route("/multipart/abort", post(multipart::abort_upload))
        .route("/multipart/parts", get(multipart::list_parts));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http());

    let router = if metrics_enabled {
        // Outermost, so it captures the full request lifecycle.
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    };

    // Part bodies are streamed to disk and capped by the stager instead.
    router.layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: echoed from the request when present, else generated
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `PartKeeper`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("PartKeeper"));

    response
}

// -- Operational endpoints ----------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Tests --------------------------------------------------------------------
