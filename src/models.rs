use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

// Token usage reported with every generation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> Option<f32> {
    Some(0.95)
}

fn default_top_k() -> Option<u32> {
    Some(40)
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), GatewayError> {
    let len = value.chars().count();
    if len < min {
        return Err(GatewayError::invalid(
            field,
            format!("{} must be at least {} characters", field, min),
        ));
    }
    if len > max {
        return Err(GatewayError::invalid(
            field,
            format!("{} must be at most {} characters", field, max),
        ));
    }
    Ok(())
}

fn check_temperature(value: f32) -> Result<(), GatewayError> {
    if !(0.0..=2.0).contains(&value) {
        return Err(GatewayError::invalid("temperature", "temperature must be between 0.0 and 2.0"));
    }
    Ok(())
}

fn check_max_tokens(value: Option<u32>) -> Result<(), GatewayError> {
    match value {
        Some(n) if n == 0 || n > 8192 => Err(GatewayError::invalid(
            "max_tokens",
            "max_tokens must be between 1 and 8192",
        )),
        _ => Ok(()),
    }
}

fn check_one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), GatewayError> {
    if !allowed.contains(&value) {
        return Err(GatewayError::invalid(
            field,
            format!("{} must be one of: {}", field, allowed.join(", ")),
        ));
    }
    Ok(())
}

// ---- text ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGenerationRequest {
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_top_p")]
    pub top_p: Option<f32>,
    #[serde(default = "default_top_k")]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
}

impl TextGenerationRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("prompt", &self.prompt, 1, 10_000)?;
        check_temperature(self.temperature)?;
        check_max_tokens(self.max_tokens)?;
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(GatewayError::invalid("top_p", "top_p must be between 0.0 and 1.0"));
            }
        }
        if self.top_k == Some(0) {
            return Err(GatewayError::invalid("top_k", "top_k must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextGenerationResponse {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::invalid("messages", "at least one message is required"));
        }
        for message in &self.messages {
            check_one_of("role", &message.role, &["user", "assistant", "system"])?;
            check_len("content", &message.content, 1, usize::MAX)?;
        }
        check_temperature(self.temperature)?;
        check_max_tokens(self.max_tokens)
    }

    // the conversation flattened into one prompt
    pub fn transcript(&self) -> String {
        let mut text = String::new();
        if let Some(instruction) = &self.system_instruction {
            text.push_str(&format!("System: {}\n", instruction));
        }
        for message in &self.messages {
            text.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub conversation_id: String,
    pub usage: Usage,
    pub model: String,
}

fn default_summary_style() -> String {
    "concise".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeRequest {
    pub text: String,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default = "default_summary_style")]
    pub style: String,
}

impl SummarizeRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("text", &self.text, 1, usize::MAX)?;
        if self.max_length == Some(0) {
            return Err(GatewayError::invalid("max_length", "max_length must be greater than 0"));
        }
        check_one_of("style", &self.style, &["concise", "detailed", "bullets"])
    }

    pub fn prompt(&self) -> String {
        let mut prompt = format!("Summarize the following text in a {} style", self.style);
        if let Some(words) = self.max_length {
            prompt.push_str(&format!(" in approximately {} words", words));
        }
        prompt.push_str(&format!(":\n\n{}", self.text));
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub summary: String,
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub text: String,
    pub target_language: String,
    #[serde(default)]
    pub source_language: Option<String>,
}

impl TranslateRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("text", &self.text, 1, usize::MAX)?;
        check_len("target_language", &self.target_language, 2, 5)?;
        if let Some(source) = &self.source_language {
            check_len("source_language", source, 2, 5)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
    pub confidence: Option<f64>,
}

fn default_extraction_type() -> String {
    "entities".to_string()
}

fn default_extract_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub text: String,
    #[serde(default = "default_extraction_type")]
    pub extraction_type: String,
    #[serde(default = "default_extract_format")]
    pub format: String,
}

impl ExtractRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("text", &self.text, 1, usize::MAX)?;
        check_one_of(
            "extraction_type",
            &self.extraction_type,
            &["entities", "keywords", "dates", "numbers", "sentiments"],
        )?;
        check_one_of("format", &self.format, &["json", "list", "text"])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub extracted_data: Value,
    pub extraction_type: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl CompleteRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("prompt", &self.prompt, 1, usize::MAX)
    }

    pub fn full_prompt(&self) -> String {
        let mut prompt = self.prompt.clone();
        if let Some(context) = &self.context {
            prompt = format!("Context: {}\n\n{}", context, prompt);
        }
        if let Some(language) = &self.language {
            prompt = format!("Complete the following {} code:\n\n{}", language, prompt);
        }
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub completion: String,
    pub model: String,
    pub usage: Usage,
}

fn default_rag_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagRequest {
    pub query: String,
    pub context_documents: Vec<String>,
    // characters of joined context handed to the model
    #[serde(default)]
    pub max_context_length: Option<usize>,
    #[serde(default = "default_rag_top_k")]
    pub top_k: usize,
}

impl RagRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_len("query", &self.query, 1, usize::MAX)?;
        if self.context_documents.is_empty() {
            return Err(GatewayError::invalid(
                "context_documents",
                "context_documents must contain at least one document",
            ));
        }
        if !(1..=20).contains(&self.top_k) {
            return Err(GatewayError::invalid("top_k", "top_k must be between 1 and 20"));
        }
        if self.max_context_length == Some(0) {
            return Err(GatewayError::invalid(
                "max_context_length",
                "max_context_length must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn documents_used(&self) -> usize {
        self.context_documents.len().min(self.top_k)
    }

    /// First `top_k` documents as context, cut to `max_context_length`.
    pub fn prompt(&self) -> String {
        let mut context = self.context_documents[..self.documents_used()].join("\n\n");
        if let Some(max) = self.max_context_length {
            if context.chars().count() > max {
                context = context.chars().take(max).collect();
            }
        }
        format!(
            "Based on the following context, answer the question:\n\nContext:\n{}\n\nQuestion: {}",
            context, self.query
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub answer: String,
    pub documents_used: usize,
    pub confidence: f64,
    pub model: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

// ---- media ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysisResponse {
    pub description: String,
    pub confidence: f64,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCaptionResponse {
    pub caption: String,
    pub style: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResponse {
    pub text: String,
    pub language: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAskResponse {
    pub answer: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCompareResponse {
    pub comparison: String,
    pub images_compared: usize,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTranslateResponse {
    pub translated_text: String,
    pub transcription: String,
    pub source_language: String,
    pub target_language: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAnalysisResponse {
    pub transcription: String,
    pub analysis_type: String,
    pub sentiment: Option<String>,
    pub sentiment_score: Option<f64>,
    pub speaker_count: Option<u32>,
    pub keywords: Vec<String>,
    // estimate from the upload size
    pub duration: f64,
    pub language: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAnalysisResponse {
    pub summary: String,
    pub analysis_type: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescribeResponse {
    pub description: String,
    pub frame_interval: u32,
    pub include_timestamps: bool,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAudioResponse {
    pub transcription: String,
    pub language: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultimodalResponse {
    pub text: String,
    pub sources_used: Vec<String>,
    pub model: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

// ---- health ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub token_count: u64,
    pub text_length: usize,
    pub model: String,
}
