use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::models::{HealthResponse, TokenCountRequest, TokenCountResponse};
use crate::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn status(status: &str) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: status.to_string(),
        version: VERSION.to_string(),
    })
}

pub async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": VERSION,
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "health": "/health",
        "metrics": "/metrics",
        "cache_backend": state.cache.backend(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn health() -> Json<HealthResponse> {
    status("healthy")
}

pub async fn live() -> Json<HealthResponse> {
    status("alive")
}

// one upstream call without retries, 503 when it fails
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, GatewayError> {
    state.service.check_ready().await.map_err(|e| {
        tracing::error!(error = %e, "readiness check failed");
        GatewayError::unavailable("Service not ready")
    })?;
    Ok(status("ready"))
}

pub async fn models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models = state.service.models();
    Json(json!({
        "text": models.text,
        "vision": models.vision,
        "audio": models.audio,
    }))
}

pub async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.cache.clear().await;
    tracing::info!(backend = state.cache.backend(), "cache cleared");
    Json(json!({ "cleared": state.cache.is_enabled() }))
}

pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenCountRequest>,
) -> Json<TokenCountResponse> {
    let token_count = state.service.count_tokens(&payload.text).await;
    Json(TokenCountResponse {
        token_count,
        text_length: payload.text.chars().count(),
        model: state.service.models().text.clone(),
    })
}
