use axum::{
    Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::models::{ChatRequest, TextGenerationRequest};
use crate::service::GenerationParams;
use crate::state::AppState;
use crate::upstream::TextStream;

fn chunk_event(text: &str, finish: bool) -> Event {
    Event::default().data(json!({ "text": text, "finish": finish }).to_string())
}

// Upstream chunks as `data:` events, always closed by a finish event
fn event_stream(chunks: TextStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = chunks
        .map(|chunk| match chunk {
            Ok(text) => chunk_event(&text, false),
            Err(e) => {
                tracing::warn!(error = %e, "upstream stream interrupted");
                let payload = json!({ "text": "", "finish": false, "error": e.to_string() });
                Event::default().data(payload.to_string())
            }
        })
        .chain(stream::once(async { chunk_event("", true) }))
        .map(Ok::<_, Infallible>);

    Sse::new(events).keep_alive(KeepAlive::default())
}

pub async fn stream_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TextGenerationRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    payload.validate()?;

    let params = GenerationParams {
        temperature: Some(payload.temperature),
        max_tokens: payload.max_tokens,
        top_p: payload.top_p,
        top_k: payload.top_k,
        stop_sequences: payload.stop_sequences.clone(),
        model: payload.model.clone(),
    };
    let chunks = state.service.stream(&payload.prompt, &params).await?;
    Ok(event_stream(chunks))
}

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    payload.validate()?;
    tracing::info!(messages = payload.messages.len(), "streaming chat request");

    let params = GenerationParams {
        temperature: Some(payload.temperature),
        max_tokens: payload.max_tokens,
        model: payload.model.clone(),
        ..Default::default()
    };
    let chunks = state.service.stream(&payload.transcript(), &params).await?;
    Ok(event_stream(chunks))
}
