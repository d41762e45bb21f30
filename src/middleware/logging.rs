//! Request logging middleware.
//!
//! Logs every API request with method, path, status code, and latency. The
//! query string is never logged since it may carry a token.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, "Request failed (5xx)");
    } else if status >= 400 {
        info!(method = %method, path = %path, status, latency_ms, "Request rejected (4xx)");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "Request completed");
    }

    response
}
