use std::sync::Arc;
use std::time::Instant;

use crate::cache::ResponseCache;
use crate::config::Args;
use crate::rate_limit::RateLimiter;
use crate::service::GenerativeService;

// app's shared state, built once in main
pub struct AppState {
    pub settings: Args,
    pub service: GenerativeService,
    pub cache: ResponseCache,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}
