use axum::{
    Json,
    extract::{Multipart, Query, State},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::cached;
use crate::cache::fingerprint_bytes;
use crate::config::Args;
use crate::error::GatewayError;
use crate::models::{
    AudioAnalysisResponse, AudioTranslateResponse, ImageAnalysisResponse, ImageAskResponse,
    ImageCaptionResponse, ImageCompareResponse, MultimodalResponse, OcrResponse,
    TranscriptionResponse, VideoAnalysisResponse, VideoAudioResponse, VideoDescribeResponse,
};
use crate::service::{GenerationParams, MediaPart};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Audio,
    Video,
}

impl MediaKind {
    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    fn allowed<'a>(&self, settings: &'a Args) -> &'a [String] {
        match self {
            MediaKind::Image => &settings.allowed_image_types,
            MediaKind::Audio => &settings.allowed_audio_types,
            MediaKind::Video => &settings.allowed_video_types,
        }
    }

    fn of(settings: &Args, mime_type: &str) -> Option<Self> {
        [MediaKind::Image, MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .find(|kind| kind.allowed(settings).iter().any(|t| t == mime_type))
    }
}

#[derive(Debug)]
struct Upload {
    file_name: Option<String>,
    part: MediaPart,
}

// Multipart body split into its file parts and text fields
#[derive(Debug, Default)]
struct Form {
    files: Vec<Upload>,
    fields: Vec<(String, String)>,
}

impl Form {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn single_file(mut self, kind: MediaKind) -> Result<Upload, GatewayError> {
        if self.files.is_empty() {
            return Err(GatewayError::file(
                kind.as_str(),
                "No file uploaded, expected a 'file' field",
            ));
        }
        Ok(self.files.swap_remove(0))
    }
}

async fn read_form(mut multipart: Multipart) -> Result<Form, GatewayError> {
    let mut form = Form::default();
    let malformed = |e: axum::extract::multipart::MultipartError| {
        GatewayError::FileProcessing {
            message: format!("Failed to read upload: {}", e),
            file_type: None,
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_some() || name == "file" || name == "files" {
            let file_name = field.file_name().map(str::to_string);
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field.bytes().await.map_err(malformed)?;
            form.files.push(Upload {
                file_name,
                part: MediaPart {
                    mime_type,
                    data: data.to_vec(),
                },
            });
        } else {
            let value = field.text().await.map_err(malformed)?;
            form.fields.push((name, value));
        }
    }
    Ok(form)
}

// Size and type checks against the configured limits
fn validate_upload(settings: &Args, upload: &Upload, kind: MediaKind) -> Result<(), GatewayError> {
    let mime_type = upload.part.mime_type.as_str();
    let size = upload.part.data.len();

    if size == 0 {
        return Err(GatewayError::file(mime_type, "Uploaded file is empty"));
    }
    if size > settings.max_file_size_bytes() {
        return Err(GatewayError::file(
            mime_type,
            format!(
                "File size {:.2}MB exceeds maximum of {}MB",
                size as f64 / (1024.0 * 1024.0),
                settings.max_file_size_mb
            ),
        ));
    }

    let allowed = kind.allowed(settings);
    if !allowed.iter().any(|t| t == mime_type) {
        return Err(GatewayError::file(
            mime_type,
            format!(
                "File type '{}' not allowed. Allowed types: {}",
                mime_type,
                allowed.join(", ")
            ),
        ));
    }

    tracing::info!(
        file_name = upload.file_name.as_deref().unwrap_or("-"),
        size,
        mime_type,
        "file validated"
    );
    Ok(())
}

async fn single_upload(
    state: &AppState,
    multipart: Multipart,
    kind: MediaKind,
) -> Result<Upload, GatewayError> {
    let upload = read_form(multipart).await?.single_file(kind)?;
    validate_upload(&state.settings, &upload, kind)?;
    Ok(upload)
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeImageQuery {
    #[serde(default = "default_image_prompt")]
    prompt: String,
}

fn default_image_prompt() -> String {
    "Describe this image in detail".to_string()
}

/// Cached by the upload digest together with prompt and model.
pub async fn analyze_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyzeImageQuery>,
    multipart: Multipart,
) -> Result<Json<ImageAnalysisResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Image).await?;
    let model = state.service.models().vision.clone();

    let params = json!({
        "digest": fingerprint_bytes(&upload.part.data),
        "prompt": query.prompt,
        "model": model,
    });
    let response = cached(&state, "image.analyze", params, || async {
        let generation = state
            .service
            .analyze_media(std::slice::from_ref(&upload.part), &query.prompt, &model)
            .await?;
        Ok::<_, GatewayError>(ImageAnalysisResponse {
            description: generation.text,
            confidence: 0.9,
            model: generation.model,
            created_at: generation.created_at,
        })
    })
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct CaptionQuery {
    #[serde(default = "default_caption_style")]
    style: String,
}

fn default_caption_style() -> String {
    "descriptive".to_string()
}

pub async fn caption_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CaptionQuery>,
    multipart: Multipart,
) -> Result<Json<ImageCaptionResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Image).await?;
    let prompt = format!("Generate a {} caption for this image", query.style);

    let generation = state
        .service
        .analyze_media(&[upload.part], &prompt, &state.service.models().vision)
        .await?;

    Ok(Json(ImageCaptionResponse {
        caption: generation.text,
        style: query.style,
        model: generation.model,
        created_at: generation.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    #[serde(default = "default_compare_prompt")]
    prompt: String,
}

fn default_compare_prompt() -> String {
    "Compare these images".to_string()
}

/// Every uploaded image goes to the model in a single request.
pub async fn compare_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompareQuery>,
    multipart: Multipart,
) -> Result<Json<ImageCompareResponse>, GatewayError> {
    let form = read_form(multipart).await?;
    if form.files.len() < 2 {
        return Err(GatewayError::file(
            MediaKind::Image.as_str(),
            "At least two images are required for comparison",
        ));
    }

    let mut parts = Vec::with_capacity(form.files.len());
    for upload in form.files {
        validate_upload(&state.settings, &upload, MediaKind::Image)?;
        parts.push(upload.part);
    }

    let generation = state
        .service
        .analyze_media(&parts, &query.prompt, &state.service.models().vision)
        .await?;

    Ok(Json(ImageCompareResponse {
        comparison: generation.text,
        images_compared: parts.len(),
        model: generation.model,
        created_at: generation.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LanguageQuery {
    #[serde(default)]
    language: Option<String>,
}

impl LanguageQuery {
    // explicit language, "auto" counts as none
    fn explicit(&self) -> Option<&str> {
        self.language.as_deref().filter(|l| *l != "auto")
    }
}

pub async fn ocr_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LanguageQuery>,
    multipart: Multipart,
) -> Result<Json<OcrResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Image).await?;
    let mut prompt = "Extract all text from this image".to_string();
    if let Some(language) = query.explicit() {
        prompt.push_str(&format!(". Language: {}", language));
    }

    let generation = state
        .service
        .analyze_media(&[upload.part], &prompt, &state.service.models().vision)
        .await?;

    Ok(Json(OcrResponse {
        text: generation.text,
        language: query.explicit().unwrap_or("en").to_string(),
        model: generation.model,
        created_at: generation.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AskQuery {
    #[serde(default)]
    question: String,
}

pub async fn ask_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AskQuery>,
    multipart: Multipart,
) -> Result<Json<ImageAskResponse>, GatewayError> {
    if query.question.trim().is_empty() {
        return Err(GatewayError::invalid("question", "question must not be empty"));
    }
    let upload = single_upload(&state, multipart, MediaKind::Image).await?;

    let generation = state
        .service
        .analyze_media(&[upload.part], &query.question, &state.service.models().vision)
        .await?;

    Ok(Json(ImageAskResponse {
        answer: generation.text,
        model: generation.model,
        created_at: generation.created_at,
    }))
}

fn transcription_prompt(language: Option<&str>) -> String {
    match language {
        Some(language) => format!("Transcribe this audio. Language: {}", language),
        None => "Transcribe this audio.".to_string(),
    }
}

pub async fn transcribe_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LanguageQuery>,
    multipart: Multipart,
) -> Result<Json<TranscriptionResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Audio).await?;

    let generation = state
        .service
        .analyze_media(
            &[upload.part],
            &transcription_prompt(query.explicit()),
            &state.service.models().audio,
        )
        .await?;

    Ok(Json(TranscriptionResponse {
        text: generation.text,
        language: query.explicit().unwrap_or("en").to_string(),
        model: generation.model,
        created_at: generation.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AudioAnalysisQuery {
    #[serde(default = "default_audio_analysis")]
    analysis_type: String,
}

fn default_audio_analysis() -> String {
    "full".to_string()
}

// rough duration of an upload, 16k bytes per second
fn estimated_duration(bytes: usize) -> f64 {
    bytes as f64 / 16_000.0
}

// Label and score from a one-word sentiment reply
fn sentiment_of(reply: &str) -> (&'static str, f64) {
    let reply = reply.to_lowercase();
    if reply.contains("negative") {
        ("negative", -1.0)
    } else if reply.contains("positive") {
        ("positive", 1.0)
    } else {
        ("neutral", 0.0)
    }
}

/// Transcript first; sentiment takes a second call on the transcript.
pub async fn analyze_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AudioAnalysisQuery>,
    multipart: Multipart,
) -> Result<Json<AudioAnalysisResponse>, GatewayError> {
    let analysis = query.analysis_type.as_str();
    if !["full", "sentiment", "speakers", "keywords"].contains(&analysis) {
        return Err(GatewayError::invalid(
            "analysis_type",
            "analysis_type must be one of: full, sentiment, speakers, keywords",
        ));
    }
    let upload = single_upload(&state, multipart, MediaKind::Audio).await?;
    let duration = estimated_duration(upload.part.data.len());

    let transcription = state
        .service
        .analyze_media(
            &[upload.part],
            &transcription_prompt(None),
            &state.service.models().audio,
        )
        .await?;

    let (mut sentiment, mut sentiment_score) = (None, None);
    if matches!(analysis, "full" | "sentiment") {
        let prompt = format!(
            "Classify the sentiment of this transcript as positive, negative or neutral. \
             Answer with one word.\n\n{}",
            transcription.text
        );
        let reply = state
            .service
            .generate(&prompt, &GenerationParams::default())
            .await?;
        let (label, score) = sentiment_of(&reply.text);
        sentiment = Some(label.to_string());
        sentiment_score = Some(score);
    }

    let keywords = if matches!(analysis, "full" | "keywords") {
        transcription
            .text
            .split_whitespace()
            .take(10)
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    Ok(Json(AudioAnalysisResponse {
        transcription: transcription.text,
        analysis_type: query.analysis_type.clone(),
        sentiment,
        sentiment_score,
        speaker_count: matches!(analysis, "full" | "speakers").then_some(1),
        keywords,
        duration,
        language: "en".to_string(),
        model: transcription.model,
        created_at: transcription.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AudioTranslateQuery {
    #[serde(default)]
    target_language: String,
    #[serde(default)]
    source_language: Option<String>,
}

// Transcribe first, then translate the transcript as text
pub async fn translate_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AudioTranslateQuery>,
    multipart: Multipart,
) -> Result<Json<AudioTranslateResponse>, GatewayError> {
    let target = query.target_language.trim();
    if !(2..=5).contains(&target.chars().count()) {
        return Err(GatewayError::invalid(
            "target_language",
            "target_language must be a 2 to 5 character language code",
        ));
    }
    let upload = single_upload(&state, multipart, MediaKind::Audio).await?;

    let transcription = state
        .service
        .analyze_media(
            &[upload.part],
            &transcription_prompt(query.source_language.as_deref()),
            &state.service.models().audio,
        )
        .await?;

    let prompt = format!(
        "Translate the following text to {}: {}",
        target, transcription.text
    );
    let translated = state
        .service
        .generate(&prompt, &GenerationParams::default())
        .await?;

    Ok(Json(AudioTranslateResponse {
        translated_text: translated.text,
        transcription: transcription.text,
        source_language: query.source_language.unwrap_or_else(|| "en".to_string()),
        target_language: target.to_string(),
        model: translated.model,
        created_at: translated.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    #[serde(default = "default_video_prompt")]
    prompt: String,
    #[serde(default = "default_analysis_type")]
    analysis_type: String,
}

fn default_video_prompt() -> String {
    "Analyze this video".to_string()
}

fn default_analysis_type() -> String {
    "summary".to_string()
}

pub async fn analyze_video(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VideoQuery>,
    multipart: Multipart,
) -> Result<Json<VideoAnalysisResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Video).await?;

    let generation = state
        .service
        .analyze_media(&[upload.part], &query.prompt, &state.service.models().vision)
        .await?;

    Ok(Json(VideoAnalysisResponse {
        summary: generation.text,
        analysis_type: query.analysis_type,
        model: generation.model,
        created_at: generation.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DescribeQuery {
    #[serde(default = "default_frame_interval")]
    frame_interval: u32,
    #[serde(default = "default_true")]
    include_timestamps: bool,
}

fn default_frame_interval() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

pub async fn describe_video(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DescribeQuery>,
    multipart: Multipart,
) -> Result<Json<VideoDescribeResponse>, GatewayError> {
    if query.frame_interval == 0 {
        return Err(GatewayError::invalid(
            "frame_interval",
            "frame_interval must be greater than 0",
        ));
    }
    let upload = single_upload(&state, multipart, MediaKind::Video).await?;

    let mut prompt = format!(
        "Describe this video frame by frame, one description every {} frames",
        query.frame_interval
    );
    if query.include_timestamps {
        prompt.push_str(", each starting with its timestamp in seconds");
    }

    let generation = state
        .service
        .analyze_media(&[upload.part], &prompt, &state.service.models().vision)
        .await?;

    Ok(Json(VideoDescribeResponse {
        description: generation.text,
        frame_interval: query.frame_interval,
        include_timestamps: query.include_timestamps,
        model: generation.model,
        created_at: generation.created_at,
    }))
}

// The soundtrack is transcribed by the audio model straight from the video
pub async fn extract_video_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LanguageQuery>,
    multipart: Multipart,
) -> Result<Json<VideoAudioResponse>, GatewayError> {
    let upload = single_upload(&state, multipart, MediaKind::Video).await?;
    let mut prompt = "Transcribe the audio track of this video.".to_string();
    if let Some(language) = query.explicit() {
        prompt.push_str(&format!(" Language: {}", language));
    }

    let generation = state
        .service
        .analyze_media(&[upload.part], &prompt, &state.service.models().audio)
        .await?;

    Ok(Json(VideoAudioResponse {
        transcription: generation.text,
        language: query.explicit().unwrap_or("en").to_string(),
        model: generation.model,
        created_at: generation.created_at,
    }))
}

/// Prompt plus any number of files of any allowed type, in one request.
pub async fn process_multimodal(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<MultimodalResponse>, GatewayError> {
    let form = read_form(multipart).await?;
    let prompt = form
        .field("prompt")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| GatewayError::invalid("prompt", "prompt is required"))?
        .to_string();

    let mut sources = Vec::new();
    let mut full_prompt = prompt.clone();
    if let Some(text) = form.field("text").filter(|t| !t.trim().is_empty()) {
        full_prompt.push_str(&format!("\n\n{}", text));
        sources.push("text".to_string());
    }

    let mut parts = Vec::with_capacity(form.files.len());
    for upload in form.files {
        let kind = MediaKind::of(&state.settings, &upload.part.mime_type).ok_or_else(|| {
            GatewayError::file(
                &upload.part.mime_type,
                format!("File type '{}' not allowed", upload.part.mime_type),
            )
        })?;
        validate_upload(&state.settings, &upload, kind)?;
        sources.push(kind.as_str().to_string());
        parts.push(upload.part);
    }

    let generation = state
        .service
        .analyze_media(&parts, &full_prompt, &state.service.models().vision)
        .await?;

    Ok(Json(MultimodalResponse {
        text: generation.text,
        sources_used: sources,
        model: generation.model,
        usage: generation.usage,
        created_at: generation.created_at,
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::handlers::{router, testing::state_with};
    use crate::upstream::mock::{ScriptedUpstream, reply};

    const BOUNDARY: &str = "X-GATEWAY-TEST-BOUNDARY";

    // (name, file name, content type, body)
    fn multipart(uri: &str, parts: &[(&str, Option<&str>, Option<&str>, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, file_name, content_type, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            let disposition = match file_name {
                Some(file_name) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, file_name
                ),
                None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", name),
            };
            body.extend_from_slice(disposition.as_bytes());
            if let Some(content_type) = content_type {
                body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
            }
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn image_analysis_is_cached_by_content() {
        let upstream = Arc::new(ScriptedUpstream::answering("a red car"));
        let app = router(state_with(upstream.clone(), &[]));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(multipart(
                    "/api/v1/image/analyze",
                    &[("file", Some("car.png"), Some("image/png"), "png-bytes")],
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await["description"], "a red car");
        }
        assert_eq!(upstream.call_count(), 1);

        let response = app
            .oneshot(multipart(
                "/api/v1/image/analyze",
                &[("file", Some("other.png"), Some("image/png"), "other-bytes")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn disallowed_type_is_a_file_processing_error() {
        let upstream = Arc::new(ScriptedUpstream::answering("never"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/image/caption",
                &[("file", Some("doc.pdf"), Some("application/pdf"), "%PDF")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "FILE_PROCESSING_ERROR");
        assert_eq!(body["details"]["file_type"], "application/pdf");
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let upstream = Arc::new(ScriptedUpstream::answering("never"));
        let app = router(state_with(upstream.clone(), &["--max-file-size-mb", "1"]));
        let big = "a".repeat(1024 * 1024 + 1);

        let response = app
            .oneshot(multipart(
                "/api/v1/audio/transcribe",
                &[("file", Some("a.wav"), Some("audio/wav"), big.as_str())],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "FILE_PROCESSING_ERROR");
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn audio_translation_transcribes_then_translates() {
        let upstream = Arc::new(ScriptedUpstream::answering("hola"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/audio/translate?target_language=es",
                &[("file", Some("a.mp3"), Some("audio/mpeg"), "mp3")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["target_language"], "es");
        assert_eq!(body["source_language"], "en");
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn multimodal_reports_sources_used() {
        let upstream = Arc::new(ScriptedUpstream::answering("insight"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/multimodal/process",
                &[
                    ("prompt", None, None, "What do these show?"),
                    ("text", None, None, "extra context"),
                    ("file", Some("a.png"), Some("image/png"), "png"),
                    ("file", Some("b.mp4"), Some("video/mp4"), "mp4"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["sources_used"], serde_json::json!(["text", "image", "video"]));

        let (_, request) = upstream.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.contents[0].parts.len(), 3);
    }

    #[tokio::test]
    async fn multimodal_requires_a_prompt() {
        let app = router(state_with(Arc::new(ScriptedUpstream::answering("x")), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/multimodal/process",
                &[("file", Some("a.png"), Some("image/png"), "png")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn compare_sends_every_image_in_one_call() {
        let upstream = Arc::new(ScriptedUpstream::answering("the left one is brighter"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/image/compare?prompt=Which%20is%20brighter",
                &[
                    ("files", Some("a.png"), Some("image/png"), "png-a"),
                    ("files", Some("b.webp"), Some("image/webp"), "webp-b"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["comparison"], "the left one is brighter");
        assert_eq!(body["images_compared"], 2);
        assert_eq!(upstream.call_count(), 1);

        let (_, request) = upstream.last_request.lock().unwrap().clone().unwrap();
        let parts = &request.contents[0].parts;
        assert_eq!(parts[0].text.as_deref(), Some("Which is brighter"));
        assert_eq!(parts.len(), 3);
    }

    #[tokio::test]
    async fn compare_rejects_a_non_image_among_the_files() {
        let upstream = Arc::new(ScriptedUpstream::answering("never"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/image/compare",
                &[
                    ("files", Some("a.png"), Some("image/png"), "png"),
                    ("files", Some("b.wav"), Some("audio/wav"), "wav"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "FILE_PROCESSING_ERROR");
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn audio_analysis_adds_sentiment_and_keywords() {
        let upstream = Arc::new(
            ScriptedUpstream::answering("Positive")
                .then(Ok(reply("we shipped the release on time"))),
        );
        let app = router(state_with(upstream.clone(), &[]));
        let two_seconds = "x".repeat(32_000);

        let response = app
            .oneshot(multipart(
                "/api/v1/audio/analyze",
                &[("file", Some("a.wav"), Some("audio/wav"), two_seconds.as_str())],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["transcription"], "we shipped the release on time");
        assert_eq!(body["sentiment"], "positive");
        assert_eq!(body["sentiment_score"], 1.0);
        assert_eq!(body["keywords"][1], "shipped");
        assert_eq!(body["duration"], 2.0);
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn keyword_analysis_skips_the_sentiment_call() {
        let upstream = Arc::new(ScriptedUpstream::answering("one two three"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/audio/analyze?analysis_type=keywords",
                &[("file", Some("a.wav"), Some("audio/wav"), "wav")],
            ))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert!(body["sentiment"].is_null());
        assert!(body["speaker_count"].is_null());
        assert_eq!(body["keywords"], serde_json::json!(["one", "two", "three"]));
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn video_describe_asks_for_the_interval() {
        let upstream = Arc::new(ScriptedUpstream::answering("0s: a park"));
        let app = router(state_with(upstream.clone(), &[]));

        let response = app
            .oneshot(multipart(
                "/api/v1/video/describe?frame_interval=10&include_timestamps=false",
                &[("file", Some("v.mp4"), Some("video/mp4"), "mp4")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["frame_interval"], 10);
        assert_eq!(body["include_timestamps"], false);

        let (_, request) = upstream.last_request.lock().unwrap().clone().unwrap();
        let prompt = request.contents[0].parts[0].text.clone().unwrap();
        assert!(prompt.contains("every 10 frames"));
        assert!(!prompt.contains("timestamp"));
    }

    #[tokio::test]
    async fn video_audio_goes_to_the_audio_model() {
        let upstream = Arc::new(ScriptedUpstream::answering("hello and welcome"));
        let app = router(state_with(upstream.clone(), &["--model-audio", "audio-x"]));

        let response = app
            .oneshot(multipart(
                "/api/v1/video/extract-audio?language=fr",
                &[("file", Some("v.webm"), Some("video/webm"), "webm")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["transcription"], "hello and welcome");
        assert_eq!(body["language"], "fr");
        assert_eq!(body["model"], "audio-x");
    }
}
