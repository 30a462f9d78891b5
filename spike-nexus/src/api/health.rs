//! Health Check Endpoint
//!
//! - `/health` – general health check
//!
//! The endpoint includes a `Cache-Control: no-cache` header to prevent
//! caching of responses. Nexus only builds its router after recovery and
//! KEK initialization succeeded, so reaching the handler means healthy.

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the health endpoint.
pub(crate) fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}
