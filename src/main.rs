mod cache;
mod clock;
mod config;
mod error;
mod handlers;
mod metrics;
mod middleware;
mod models;
mod rate_limit;
mod retry;
mod service;
mod state;
mod upstream;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{CacheStore, MemoryStore, RedisStore, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{Args, LogFormat};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;
use crate::service::{GenerativeService, Models};
use crate::state::AppState;
use crate::upstream::GeminiClient;

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("genai_gateway={},tower_http=info", args.log_level))
    });

    let (json, text) = match args.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

// Redis when configured and reachable, the in-process store otherwise
async fn cache_store(args: &Args) -> Arc<dyn CacheStore> {
    let Some(url) = args.redis_url.as_deref().filter(|u| !u.is_empty()) else {
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::connect(url).await {
        Ok(store) => {
            tracing::info!("connected to redis cache");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(error = %e, "redis unavailable, using in-memory cache");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(&args);

    if args.api_key.is_empty() {
        tracing::warn!("GOOGLE_API_KEY is not set, upstream calls will be rejected");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let rate_limiter = Arc::new(RateLimiter::new(args.rate_limit_enabled, clock.clone()));
    let cache = ResponseCache::new(
        args.cache_enabled,
        args.cache_ttl(),
        args.cache_max_size,
        cache_store(&args).await,
        clock,
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.upstream_timeout))
        .build()
        .context("building http client")?;
    let service = GenerativeService::new(
        Arc::new(GeminiClient::new(http, &args.upstream_url, &args.api_key)),
        RetryExecutor::new(args.retry_policy()),
        Models {
            text: args.model_text.clone(),
            vision: args.model_vision.clone(),
            audio: args.model_audio.clone(),
        },
    );

    // background sweep of idle rate limit windows
    tokio::spawn(rate_limit::sweeper(
        rate_limiter.clone(),
        Duration::from_secs(args.sweep_interval.max(1)),
    ));

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!(
        addr = %addr,
        upstream = %args.upstream_url,
        cache_enabled = args.cache_enabled,
        cache_backend = cache.backend(),
        cache_ttl_secs = args.cache_ttl,
        rate_limit_enabled = args.rate_limit_enabled,
        per_minute = args.rate_limit_per_minute,
        per_hour = args.rate_limit_per_hour,
        "gateway starting"
    );

    let state = Arc::new(AppState {
        settings: args,
        service,
        cache,
        rate_limiter,
        started_at: Instant::now(),
    });
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
