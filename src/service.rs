//! Generation operations over an [`Upstream`], every call through the retry executor.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::models::Usage;
use crate::retry::RetryExecutor;
use crate::upstream::{
    Content, ContentRequest, ContentResponse, GenerationConfig, Part, TextStream, Upstream,
};

const DEFAULT_FINISH_REASON: &str = "COMPLETE";

// Rough token count, four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

#[derive(Debug, Clone)]
pub struct Models {
    pub text: String,
    pub vision: String,
    pub audio: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub model: Option<String>,
}

impl GenerationParams {
    fn config(&self) -> Option<GenerationConfig> {
        let config = GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
            stop_sequences: self.stop_sequences.clone(),
        };
        (config != GenerationConfig::default()).then_some(config)
    }
}

// Raw media handed to the model alongside a prompt
#[derive(Debug, Clone)]
pub struct MediaPart {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    fn from_response(response: ContentResponse, model: &str, prompt: &str) -> Self {
        let text = response.text();
        let finish_reason = response
            .finish_reason()
            .unwrap_or(DEFAULT_FINISH_REASON)
            .to_string();

        let reported = response.usage_metadata.as_ref();
        let prompt_tokens = reported
            .and_then(|u| u.prompt_token_count)
            .unwrap_or_else(|| estimate_tokens(prompt));
        let completion_tokens = reported
            .and_then(|u| u.candidates_token_count)
            .unwrap_or_else(|| estimate_tokens(&text));
        let total_tokens = reported
            .and_then(|u| u.total_token_count)
            .unwrap_or(prompt_tokens + completion_tokens);

        Self {
            text,
            model: model.to_string(),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            },
            finish_reason,
            created_at: Utc::now(),
        }
    }
}

pub struct GenerativeService {
    upstream: Arc<dyn Upstream>,
    retry: RetryExecutor,
    models: Models,
}

impl GenerativeService {
    pub fn new(upstream: Arc<dyn Upstream>, retry: RetryExecutor, models: Models) -> Self {
        Self {
            upstream,
            retry,
            models,
        }
    }

    pub fn models(&self) -> &Models {
        &self.models
    }

    async fn run(
        &self,
        model: &str,
        request: ContentRequest,
        prompt: &str,
    ) -> Result<Generation, GatewayError> {
        let upstream = &self.upstream;
        let request = &request;
        let response = self
            .retry
            .execute(move || upstream.generate_content(model, request))
            .await?;

        let generation = Generation::from_response(response, model, prompt);
        tracing::debug!(
            model,
            prompt_tokens = generation.usage.prompt_tokens,
            completion_tokens = generation.usage.completion_tokens,
            finish_reason = %generation.finish_reason,
            "generation finished"
        );
        Ok(generation)
    }

    /// Text generation on the text model unless `params.model` overrides it.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GatewayError> {
        let model = params.model.as_deref().unwrap_or(&self.models.text);
        tracing::info!(model, prompt_chars = prompt.len(), "generating text");

        let request = ContentRequest {
            contents: vec![Content::user(vec![Part::text(prompt)])],
            generation_config: params.config(),
        };
        self.run(model, request, prompt).await
    }

    /// Streamed text generation. Only opening the stream is retried; once
    /// chunks flow, a failure ends the stream.
    pub async fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, GatewayError> {
        let model = params.model.as_deref().unwrap_or(&self.models.text);
        tracing::info!(model, prompt_chars = prompt.len(), "streaming text");

        let request = ContentRequest {
            contents: vec![Content::user(vec![Part::text(prompt)])],
            generation_config: params.config(),
        };
        let upstream = &self.upstream;
        let request = &request;
        self.retry
            .execute(move || upstream.stream_content(model, request))
            .await
    }

    /// Prompt plus inline media (images, audio, video) in one request.
    pub async fn analyze_media(
        &self,
        parts: &[MediaPart],
        prompt: &str,
        model: &str,
    ) -> Result<Generation, GatewayError> {
        tracing::info!(
            model,
            parts = parts.len(),
            bytes = parts.iter().map(|p| p.data.len()).sum::<usize>(),
            "analyzing media"
        );

        let mut content = vec![Part::text(prompt)];
        content.extend(
            parts
                .iter()
                .map(|p| Part::inline(p.mime_type.clone(), STANDARD.encode(&p.data))),
        );
        let request = ContentRequest {
            contents: vec![Content::user(content)],
            generation_config: None,
        };
        self.run(model, request, prompt).await
    }

    /// Token count from the upstream, the local estimate when that fails.
    pub async fn count_tokens(&self, text: &str) -> u64 {
        let upstream = &self.upstream;
        let model = self.models.text.as_str();
        let contents = vec![Content::user(vec![Part::text(text)])];
        let contents = contents.as_slice();

        match self
            .retry
            .execute(move || upstream.count_tokens(model, contents))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "token count failed, using estimate");
                estimate_tokens(text)
            }
        }
    }

    // Single upstream call, no retries, for readiness checks
    pub async fn check_ready(&self) -> Result<(), GatewayError> {
        let contents = [Content::user(vec![Part::text("health check")])];
        self.upstream
            .count_tokens(&self.models.text, &contents)
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::unavailable(format!("Upstream not reachable: {}", e)))
    }
}
