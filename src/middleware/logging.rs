use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// Logs every API request with a request id, its route and how long it took
pub async fn request_logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    tracing::debug!(request_id = %request_id, method = %method, route = %route, uri = %uri, "incoming request");

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if response.status().is_server_error() {
        tracing::error!(request_id = %request_id, method = %method, route = %route, status, duration_ms, "request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(request_id = %request_id, method = %method, route = %route, status, duration_ms, "request rejected");
    } else {
        tracing::info!(request_id = %request_id, method = %method, route = %route, status, duration_ms, "request completed");
    }

    response
}
