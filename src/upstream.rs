//! Binding to the Gemini REST API.
//!
//! Failures are classified here, at the edge, into the three kinds the retry
//! executor understands.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt::Display;

/// Text chunks of a streamed generation, in arrival order.
pub type TextStream = BoxStream<'static, Result<String, UpstreamError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Quota,
    Service,
    Unexpected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Quota => "quota",
            FailureKind::Service => "service",
            FailureKind::Unexpected => "unexpected",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("upstream returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("{0}")]
    Unexpected(String),
}

impl UpstreamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UpstreamError::QuotaExceeded(_) => FailureKind::Quota,
            UpstreamError::Service { .. } => FailureKind::Service,
            UpstreamError::Unexpected(_) => FailureKind::Unexpected,
        }
    }
}

// ---- wire format ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    // base64
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(mime_type: impl Into<String>, data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u64>,
    pub candidates_token_count: Option<u64>,
    pub total_token_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

impl ContentResponse {
    // text of the first candidate, parts joined
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.candidates.first()?.finish_reason.as_deref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenCount {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// The generative API as the gateway sees it.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        request: &ContentRequest,
    ) -> Result<ContentResponse, UpstreamError>;

    /// Opens a streamed generation. Status failures surface here, before
    /// any chunk; failures after that arrive as items of the stream.
    async fn stream_content(
        &self,
        model: &str,
        request: &ContentRequest,
    ) -> Result<TextStream, UpstreamError>;

    async fn count_tokens(&self, model: &str, contents: &[Content]) -> Result<u64, UpstreamError>;
}

// Map an error status and body to a failure kind
pub fn classify(status: StatusCode, body: &str) -> UpstreamError {
    let parsed: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let (message, upstream_status) = match parsed.error {
        Some(err) => (err.message, err.status),
        None => (body.chars().take(200).collect(), String::new()),
    };

    if status == StatusCode::TOO_MANY_REQUESTS || upstream_status == "RESOURCE_EXHAUSTED" {
        UpstreamError::QuotaExceeded(message)
    } else {
        UpstreamError::Service {
            status: status.as_u16(),
            message,
        }
    }
}

// Splits an SSE byte stream into the payloads of its `data:` lines
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let event = String::from_utf8_lossy(&event);
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }
}

fn chunk_text(payload: &str) -> Result<String, UpstreamError> {
    if let Ok(ErrorEnvelope { error: Some(err) }) = serde_json::from_str(payload) {
        return Err(UpstreamError::Service {
            status: 500,
            message: err.message,
        });
    }
    serde_json::from_str::<ContentResponse>(payload)
        .map(|response| response.text())
        .map_err(|e| UpstreamError::Unexpected(format!("invalid stream chunk: {}", e)))
}

// Raw body chunks to generated text, chunks without text are skipped
fn decode_sse<S, B, E>(body: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let pending: VecDeque<Result<String, UpstreamError>> = VecDeque::new();
    let state = (Box::pin(body), SseDecoder::default(), pending);

    stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (body, decoder, pending)));
            }
            match body.next().await {
                Some(Ok(chunk)) => pending.extend(
                    decoder
                        .push(chunk.as_ref())
                        .iter()
                        .map(|payload| chunk_text(payload))
                        .filter(|item| !matches!(item, Ok(text) if text.is_empty())),
                ),
                Some(Err(e)) => {
                    let error = UpstreamError::Unexpected(format!("stream interrupted: {}", e));
                    return Some((Err(error), (body, decoder, pending)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/v1beta/models/{}:{}", self.base_url, model, method)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        url: String,
        body: &B,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Unexpected(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        Ok(response)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, UpstreamError> {
        self.send(url, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Unexpected(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    async fn generate_content(
        &self,
        model: &str,
        request: &ContentRequest,
    ) -> Result<ContentResponse, UpstreamError> {
        self.post(self.url(model, "generateContent"), request).await
    }

    async fn stream_content(
        &self,
        model: &str,
        request: &ContentRequest,
    ) -> Result<TextStream, UpstreamError> {
        let url = format!("{}?alt=sse", self.url(model, "streamGenerateContent"));
        let response = self.send(url, request).await?;
        Ok(decode_sse(response.bytes_stream()))
    }

    async fn count_tokens(&self, model: &str, contents: &[Content]) -> Result<u64, UpstreamError> {
        let count: TokenCount = self
            .post(self.url(model, "countTokens"), &json!({ "contents": contents }))
            .await?;
        Ok(count.total_tokens)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script of responses, then keeps answering with `fallback`.
    #[derive(Default)]
    pub struct ScriptedUpstream {
        script: Mutex<VecDeque<Result<ContentResponse, UpstreamError>>>,
        fallback_text: Option<String>,
        token_count: Option<u64>,
        stream_error: Option<String>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<(String, ContentRequest)>>,
    }

    pub fn reply(text: &str) -> ContentResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap()
    }

    impl ScriptedUpstream {
        pub fn answering(text: &str) -> Self {
            Self {
                fallback_text: Some(text.to_string()),
                token_count: Some(7),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self::default()
        }

        // streams end with this error after the scripted text
        pub fn interrupting(mut self, message: &str) -> Self {
            self.stream_error = Some(message.to_string());
            self
        }

        pub fn then(self, step: Result<ContentResponse, UpstreamError>) -> Self {
            self.script.lock().unwrap().push_back(step);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn generate_content(
            &self,
            model: &str,
            request: &ContentRequest,
        ) -> Result<ContentResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some((model.to_string(), request.clone()));
            if let Some(step) = self.script.lock().unwrap().pop_front() {
                return step;
            }
            match &self.fallback_text {
                Some(text) => Ok(reply(text)),
                None => Err(UpstreamError::Service {
                    status: 500,
                    message: "scripted failure".into(),
                }),
            }
        }

        async fn stream_content(
            &self,
            model: &str,
            request: &ContentRequest,
        ) -> Result<TextStream, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some((model.to_string(), request.clone()));
            let Some(text) = &self.fallback_text else {
                return Err(UpstreamError::QuotaExceeded("scripted quota".into()));
            };

            let mut chunks: Vec<Result<String, UpstreamError>> = text
                .split_inclusive(' ')
                .map(|word| Ok(word.to_string()))
                .collect();
            if let Some(message) = &self.stream_error {
                chunks.push(Err(UpstreamError::Unexpected(message.clone())));
            }
            Ok(stream::iter(chunks).boxed())
        }

        async fn count_tokens(
            &self,
            _model: &str,
            _contents: &[Content],
        ) -> Result<u64, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token_count
                .ok_or_else(|| UpstreamError::Unexpected("count unavailable".into()))
        }
    }
}
