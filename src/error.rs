use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

/// Every error that can reach an HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    // upstream failure, 503 when the provider said so, 500 otherwise
    #[error("{message}")]
    Service { message: String, status: StatusCode },

    #[error("{message}")]
    InvalidInput {
        message: String,
        field: Option<String>,
    },

    #[error("{message}")]
    FileProcessing {
        message: String,
        file_type: Option<String>,
    },
}

impl GatewayError {
    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn file(file_type: &str, message: impl Into<String>) -> Self {
        Self::FileProcessing {
            message: message.into(),
            file_type: Some(file_type.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Service { status, .. } => *status,
            Self::InvalidInput { .. } | Self::FileProcessing { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Service { .. } => "SERVICE_ERROR",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::FileProcessing { .. } => "FILE_PROCESSING_ERROR",
        }
    }

    fn details(&self) -> Value {
        match self {
            Self::RateLimit { retry_after, .. } => json!({ "retry_after": retry_after }),
            Self::InvalidInput { field, .. } => json!({ "field": field }),
            Self::FileProcessing { file_type, .. } => json!({ "file_type": file_type }),
            Self::Service { .. } => json!({}),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::RateLimit { .. } => tracing::warn!(error = %self, "rate limit exceeded"),
            Self::Service { .. } => {
                tracing::error!(error = %self, status = %status, "service error")
            }
            _ => tracing::warn!(error = %self, "invalid request"),
        }

        let body = json!({
            "detail": self.to_string(),
            "error_code": self.error_code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "details": self.details(),
        });

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimit {
            retry_after: Some(secs),
            ..
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
