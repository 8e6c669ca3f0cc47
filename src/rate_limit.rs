use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::Clock;

// width of one bucket and how many buckets we keep, in seconds / buckets
const BUCKET_SECS: u64 = 60;
const RETENTION_BUCKETS: u64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject { retry_after: u64 },
}

impl Decision {
    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub per_minute: u32,
    pub per_hour: Option<u32>,
}

// request counts for one identifier, epoch-minute bucket -> count
#[derive(Debug, Default)]
pub struct RateWindow {
    buckets: BTreeMap<u64, u32>,
}

impl RateWindow {
    // drop every bucket that is a full hour (or more) old
    fn purge(&mut self, current: u64) {
        self.buckets
            .retain(|bucket, _| current.saturating_sub(*bucket) < RETENTION_BUCKETS);
    }

    fn count(&self, bucket: u64) -> u32 {
        self.buckets.get(&bucket).copied().unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.buckets.values().map(|c| u64::from(*c)).sum()
    }

    fn oldest(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Fixed-window request counter keyed by identifier.
///
/// Time is cut into one-minute buckets and a request is admitted while the
/// current bucket holds fewer than `limit` requests. Bursts of up to twice
/// the limit are possible across a bucket boundary; that coarseness is
/// accepted rather than moving to a sliding log.
///
/// The read and the increment for one identifier happen under that
/// identifier's map entry lock, so concurrent requests cannot lose counts.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    windows: DashMap<String, RateWindow>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            windows: DashMap::new(),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, identifier: &str, per_minute: u32) -> Decision {
        self.check_quota(
            identifier,
            Quota {
                per_minute,
                per_hour: None,
            },
        )
    }

    pub fn check_quota(&self, identifier: &str, quota: Quota) -> Decision {
        if !self.enabled {
            return Decision::Allow;
        }

        let now = self.clock.unix_secs();
        let current = now / BUCKET_SECS;

        let mut window = self.windows.entry(identifier.to_string()).or_default();
        window.purge(current);

        if let Some(per_hour) = quota.per_hour {
            if window.total() >= u64::from(per_hour) {
                // wait for the oldest bucket to leave the hour
                let oldest = window.oldest().unwrap_or(current);
                let frees_at = (oldest + RETENTION_BUCKETS) * BUCKET_SECS;
                let retry_after = frees_at.saturating_sub(now).max(1);
                tracing::debug!(identifier, per_hour, retry_after, "hourly quota exhausted");
                return Decision::Reject { retry_after };
            }
        }

        let count = window.count(current);
        if count >= quota.per_minute {
            let retry_after = BUCKET_SECS - (now % BUCKET_SECS);
            tracing::debug!(identifier, count, retry_after, "per-minute quota exhausted");
            return Decision::Reject { retry_after };
        }

        *window.buckets.entry(current).or_insert(0) += 1;
        Decision::Allow
    }

    /// Drops stale buckets everywhere and forgets identifiers with none left.
    pub fn sweep(&self) -> usize {
        let current = self.clock.unix_secs() / BUCKET_SECS;
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.purge(current);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

// Prefer the caller's api key, fall back to the peer address
pub fn resolve_identifier(api_key: Option<&str>, peer: Option<std::net::SocketAddr>) -> String {
    match api_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => format!("api_key:{}", key),
        None => peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

// Periodic sweep, runs until the process exits
pub async fn sweeper(limiter: Arc<RateLimiter>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let dropped = limiter.sweep();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = limiter.tracked(), "rate limiter sweep");
        }
    }
}
