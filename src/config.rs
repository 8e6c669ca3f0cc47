use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::rate_limit::Quota;
use crate::retry::RetryPolicy;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

// CLI argument structure, every flag can also come from the environment (or .env)
#[derive(Parser, Debug, Clone)]
#[command(name = "genai-gateway")]
#[command(about = "Caching, rate limiting gateway for the Gemini generative API")]
pub struct Args {
    // Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    // Upstream API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true, default_value = "")]
    pub api_key: String,

    // Upstream base url
    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub upstream_url: String,

    #[arg(long, env = "GEMINI_MODEL_TEXT", default_value = "gemini-2.0-flash-exp")]
    pub model_text: String,

    #[arg(long, env = "GEMINI_MODEL_VISION", default_value = "gemini-2.0-flash-exp")]
    pub model_vision: String,

    #[arg(long, env = "GEMINI_MODEL_AUDIO", default_value = "gemini-2.0-flash-exp")]
    pub model_audio: String,

    // Per request timeout on the upstream http client, seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value_t = 120)]
    pub upstream_timeout: u64,

    // Rate limit: max requests per minute / hour for one identifier
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 60)]
    pub rate_limit_per_minute: u32,

    #[arg(long, env = "RATE_LIMIT_PER_HOUR", default_value_t = 1000)]
    pub rate_limit_per_hour: u32,

    #[arg(long, env = "RATE_LIMIT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub rate_limit_enabled: bool,

    // Cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub cache_ttl: u64,

    #[arg(long, env = "CACHE_MAX_SIZE", default_value_t = 1000)]
    pub cache_max_size: usize,

    #[arg(long, env = "ENABLE_CACHE", default_value_t = true, action = clap::ArgAction::Set)]
    pub cache_enabled: bool,

    // Redis url, in-process cache when absent
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    // Upstream retry policy
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_INITIAL_DELAY", default_value = "1", value_parser = parse_delay)]
    pub retry_initial_delay: Duration,

    #[arg(long, env = "RETRY_MAX_DELAY", default_value = "60", value_parser = parse_delay)]
    pub retry_max_delay: Duration,

    // Uploads
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value_t = 10)]
    pub max_file_size_mb: usize,

    #[arg(long, env = "ALLOWED_IMAGE_TYPES", value_delimiter = ',',
        default_value = "image/jpeg,image/png,image/gif,image/webp")]
    pub allowed_image_types: Vec<String>,

    #[arg(long, env = "ALLOWED_AUDIO_TYPES", value_delimiter = ',',
        default_value = "audio/wav,audio/mpeg,audio/mp3")]
    pub allowed_audio_types: Vec<String>,

    #[arg(long, env = "ALLOWED_VIDEO_TYPES", value_delimiter = ',',
        default_value = "video/mp4,video/webm,video/quicktime")]
    pub allowed_video_types: Vec<String>,

    // CORS origins, "*" allows any
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    // Logging
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    // Interval of the rate limiter sweep, seconds
    #[arg(long, env = "SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval: u64,
}

// Fractional seconds; negative, non-finite and out of range values are rejected
fn parse_delay(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid delay '{}': {}", value, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid delay '{}': {}", value, e))
}

impl Args {
    pub fn quota(&self) -> Quota {
        Quota {
            per_minute: self.rate_limit_per_minute,
            // 0 turns the hourly quota off
            per_hour: (self.rate_limit_per_hour > 0).then_some(self.rate_limit_per_hour),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_attempts,
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn cors_any(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["genai-gateway"]);
        assert_eq!(args.port, 8000);
        assert_eq!(args.quota().per_minute, 60);
        assert_eq!(args.quota().per_hour, Some(1000));
        assert_eq!(args.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(args.retry_policy(), RetryPolicy::default());
        assert_eq!(args.max_file_size_bytes(), 10 * 1024 * 1024);
        assert!(args.cors_any());
    }

    #[test]
    fn switches_take_explicit_values() {
        let args = Args::parse_from([
            "genai-gateway",
            "--rate-limit-enabled",
            "false",
            "--cache-enabled",
            "false",
            "--allowed-image-types",
            "image/png,image/webp",
        ]);
        assert!(!args.rate_limit_enabled);
        assert!(!args.cache_enabled);
        assert_eq!(args.allowed_image_types, vec!["image/png", "image/webp"]);
    }

    #[test]
    fn delays_parse_fractions_and_reject_unrepresentable_values() {
        let args = Args::parse_from(["genai-gateway", "--retry-initial-delay", "0.25"]);
        assert_eq!(args.retry_policy().initial_delay, Duration::from_millis(250));

        for bad in ["inf", "NaN", "-1", "1e30", "soon"] {
            let flag = format!("--retry-max-delay={}", bad);
            assert!(
                Args::try_parse_from(["genai-gateway", flag.as_str()]).is_err(),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn oversized_upload_limit_saturates() {
        let max = usize::MAX.to_string();
        let args = Args::parse_from(["genai-gateway", "--max-file-size-mb", max.as_str()]);
        assert_eq!(args.max_file_size_bytes(), usize::MAX);
    }
}
