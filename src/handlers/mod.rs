mod health;
mod media;
mod stream;
mod text;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{delete, get, post},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::cache::derive_key;
use crate::error::GatewayError;
use crate::metrics::metrics_handler;
use crate::middleware::{rate_limit, trace_request};
use crate::state::AppState;

// Serve from the cache when possible, otherwise compute and store
async fn cached<T, F, Fut>(
    state: &AppState,
    operation: &str,
    params: Value,
    compute: F,
) -> Result<T, GatewayError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let key = derive_key(operation, &params);
    if let Some(hit) = state.cache.get_json::<T>(&key).await {
        tracing::info!(operation, "returning cached result");
        return Ok(hit);
    }

    let value = compute().await?;
    state.cache.set_json(&key, &value, None).await;
    Ok(value)
}

fn params_of<T: Serialize>(request: &T) -> Value {
    serde_json::to_value(request).unwrap_or(Value::Null)
}

// room for a few maximum-size uploads plus form overhead
fn body_limit(state: &AppState) -> usize {
    state
        .settings
        .max_file_size_bytes()
        .saturating_mul(4)
        .saturating_add(1024 * 1024)
}

fn cors(state: &AppState) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if state.settings.cors_any() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = state
        .settings
        .cors_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// The complete application: api routes behind the rate limiter, health and
/// metrics routes outside it.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/text/generate", post(text::generate))
        .route("/text/chat", post(text::chat))
        .route("/text/chat/stream", post(stream::chat_stream))
        .route("/text/summarize", post(text::summarize))
        .route("/text/translate", post(text::translate))
        .route("/text/extract", post(text::extract))
        .route("/text/complete", post(text::complete))
        .route("/image/analyze", post(media::analyze_image))
        .route("/image/caption", post(media::caption_image))
        .route("/image/ocr", post(media::ocr_image))
        .route("/image/ask", post(media::ask_image))
        .route("/image/compare", post(media::compare_images))
        .route("/audio/transcribe", post(media::transcribe_audio))
        .route("/audio/translate", post(media::translate_audio))
        .route("/audio/analyze", post(media::analyze_audio))
        .route("/video/analyze", post(media::analyze_video))
        .route("/video/describe", post(media::describe_video))
        .route("/video/extract-audio", post(media::extract_video_audio))
        .route("/multimodal/process", post(media::process_multimodal))
        .route("/multimodal/rag", post(text::rag))
        .route("/streaming/text", post(stream::stream_text))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(DefaultBodyLimit::max(body_limit(&state)));

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/models", get(health::models))
        .route("/tokens/count", post(health::count_tokens))
        .route("/cache", delete(health::clear_cache))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(trace_request))
        .layer(cors(&state))
        .with_state(state)
}
