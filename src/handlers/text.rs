use axum::{Json, extract::State};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{cached, params_of};
use crate::error::GatewayError;
use crate::models::{
    ChatMessage, ChatRequest, ChatResponse, CompleteRequest, CompleteResponse, ExtractRequest,
    ExtractResponse, RagRequest, RagResponse, SummarizeRequest, SummarizeResponse,
    TextGenerationRequest, TextGenerationResponse, TranslateRequest, TranslateResponse,
};
use crate::service::GenerationParams;
use crate::state::AppState;

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TextGenerationRequest>,
) -> Result<Json<TextGenerationResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "text.generate", params_of(&payload), || async {
        let params = GenerationParams {
            temperature: Some(payload.temperature),
            max_tokens: payload.max_tokens,
            top_p: payload.top_p,
            top_k: payload.top_k,
            stop_sequences: payload.stop_sequences.clone(),
            model: payload.model.clone(),
        };
        let generation = state.service.generate(&payload.prompt, &params).await?;
        Ok::<_, GatewayError>(TextGenerationResponse {
            text: generation.text,
            model: generation.model,
            usage: generation.usage,
            finish_reason: generation.finish_reason,
            created_at: generation.created_at,
        })
    })
    .await?;

    Ok(Json(response))
}

// Conversations are answered but not stored
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, GatewayError> {
    payload.validate()?;
    tracing::info!(messages = payload.messages.len(), "chat request");

    let params = GenerationParams {
        temperature: Some(payload.temperature),
        max_tokens: payload.max_tokens,
        model: payload.model.clone(),
        ..Default::default()
    };
    let generation = state.service.generate(&payload.transcript(), &params).await?;

    Ok(Json(ChatResponse {
        message: ChatMessage {
            role: "assistant".to_string(),
            content: generation.text,
            timestamp: Utc::now(),
        },
        conversation_id: uuid::Uuid::new_v4().to_string(),
        usage: generation.usage,
        model: generation.model,
    }))
}

pub async fn summarize(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SummarizeRequest>,
) -> Result<Json<SummarizeResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "text.summarize", params_of(&payload), || async {
        let generation = state
            .service
            .generate(&payload.prompt(), &GenerationParams::default())
            .await?;

        let original_length = payload.text.chars().count();
        let summary_length = generation.text.chars().count();
        let compression_ratio = if original_length > 0 {
            summary_length as f64 / original_length as f64
        } else {
            0.0
        };
        Ok::<_, GatewayError>(SummarizeResponse {
            summary: generation.text,
            original_length,
            summary_length,
            compression_ratio,
        })
    })
    .await?;

    Ok(Json(response))
}

pub async fn translate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TranslateRequest>,
) -> Result<Json<TranslateResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "text.translate", params_of(&payload), || async {
        let source = payload.source_language.as_deref().unwrap_or("auto");
        let prompt = format!(
            "Translate the following text from {} to {}: {}",
            source, payload.target_language, payload.text
        );
        let generation = state
            .service
            .generate(&prompt, &GenerationParams::default())
            .await?;

        Ok::<_, GatewayError>(TranslateResponse {
            translated_text: generation.text,
            source_language: payload.source_language.clone().unwrap_or_else(|| "en".to_string()),
            target_language: payload.target_language.clone(),
            confidence: Some(0.9),
        })
    })
    .await?;

    Ok(Json(response))
}

pub async fn extract(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "text.extract", params_of(&payload), || async {
        let prompt = format!(
            "Extract {} from the following text and return in {} format:\n\n{}",
            payload.extraction_type, payload.format, payload.text
        );
        let generation = state
            .service
            .generate(&prompt, &GenerationParams::default())
            .await?;

        let extracted_data = serde_json::from_str::<Value>(&generation.text)
            .unwrap_or_else(|_| json!({ "raw": generation.text }));
        Ok::<_, GatewayError>(ExtractResponse {
            extracted_data,
            extraction_type: payload.extraction_type.clone(),
            confidence: Some(0.85),
        })
    })
    .await?;

    Ok(Json(response))
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "text.complete", params_of(&payload), || async {
        let params = GenerationParams {
            temperature: Some(0.3),
            ..Default::default()
        };
        let generation = state.service.generate(&payload.full_prompt(), &params).await?;
        Ok::<_, GatewayError>(CompleteResponse {
            completion: generation.text,
            model: generation.model,
            usage: generation.usage,
        })
    })
    .await?;

    Ok(Json(response))
}

// Answers from the supplied documents only, no retrieval of its own
pub async fn rag(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RagRequest>,
) -> Result<Json<RagResponse>, GatewayError> {
    payload.validate()?;

    let response = cached(&state, "multimodal.rag", params_of(&payload), || async {
        let generation = state
            .service
            .generate(&payload.prompt(), &GenerationParams::default())
            .await?;
        Ok::<_, GatewayError>(RagResponse {
            answer: generation.text,
            documents_used: payload.documents_used(),
            confidence: 0.9,
            model: generation.model,
            usage: generation.usage,
            created_at: generation.created_at,
        })
    })
    .await?;

    Ok(Json(response))
}
