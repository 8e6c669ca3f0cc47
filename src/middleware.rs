use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::error::GatewayError;
use crate::metrics::{RATE_LIMITED, REQUEST_LATENCY, REQUEST_TOTAL};
use crate::rate_limit::{Decision, resolve_identifier};
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

// Admission check ahead of every api route
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.rate_limiter.is_enabled() {
        return next.run(request).await;
    }

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = resolve_identifier(api_key, peer);

    let quota = state.settings.quota();
    let decision = match quota.per_hour {
        Some(_) => state.rate_limiter.check_quota(&identifier, quota),
        None => state.rate_limiter.check(&identifier, quota.per_minute),
    };

    match decision {
        Decision::Allow => next.run(request).await,
        Decision::Reject { retry_after } => {
            RATE_LIMITED.inc();
            tracing::info!(
                identifier = %identifier,
                retry_after,
                path = %request.uri().path(),
                "request rejected by rate limiter"
            );
            GatewayError::rate_limited(
                format!("Rate limit exceeded. Retry after {} seconds", retry_after),
                retry_after,
            )
            .into_response()
        }
    }
}

// Request id, timing header and the access log line
pub async fn trace_request(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    REQUEST_TOTAL.inc();
    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = start.elapsed();
    REQUEST_LATENCY.observe(elapsed.as_secs_f64());

    let duration_ms = elapsed.as_secs_f64() * 1000.0;
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms,
        "request completed"
    );

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}ms", duration_ms)) {
        headers.insert(PROCESS_TIME_HEADER, value);
    }
    response
}
