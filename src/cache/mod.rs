//! Response cache.
//!
//! [`ResponseCache`] owns the expiry and capacity rules; where the entries
//! physically live is a [`CacheStore`] (in-process [`MemoryStore`] or
//! [`RedisStore`]). Store failures are logged and degrade to a miss or a
//! no-op, they never reach the caller.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::clock::Clock;
use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Cache entry with its absolute expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: String,
    pub expires_at: SystemTime,
}

impl CacheEntry {
    pub fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// Backing storage for cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores `entry`; `ttl` is the time left until `entry.expires_at`.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Removes the entry only if it is still expired at `now`; an entry
    /// rewritten since it was read stays. Returns whether one was removed.
    async fn delete_if_expired(&self, key: &str, now: SystemTime) -> Result<bool, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    /// Removes every entry already expired at `now`, returns how many went.
    async fn purge_expired(&self, now: SystemTime) -> Result<usize, CacheError>;

    fn backend(&self) -> &'static str;
}

// longest TTL kept, longer ones are clamped to it
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Derives the cache key for an operation and its parameters.
///
/// Object keys are sorted at every depth before hashing, so two requests
/// that differ only in parameter order share a key.
pub fn derive_key(operation: &str, params: &Value) -> String {
    let mut payload = Map::new();
    payload.insert("op".to_string(), Value::String(operation.to_string()));
    payload.insert("params".to_string(), canonicalize(params));

    let mut hasher = Sha256::new();
    hasher.update(Value::Object(payload).to_string());
    format!("{:x}", hasher.finalize())
}

// Digest of raw upload bytes, used as a cache parameter for media
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug)]
pub struct ResponseCache {
    enabled: bool,
    default_ttl: Duration,
    max_entries: usize,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(
        enabled: bool,
        default_ttl: Duration,
        max_entries: usize,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enabled,
            default_ttl,
            max_entries,
            store,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let now = self.clock.now();
        let found = match self.store.get(key).await {
            Ok(Some(entry)) if entry.is_live(now) => Some(entry.value),
            Ok(Some(_)) => {
                // expired, lazy eviction
                if let Err(e) = self.store.delete_if_expired(key, now).await {
                    tracing::warn!(key, error = %e, "cache delete of expired entry failed");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache get failed");
                None
            }
        };

        if found.is_some() {
            CACHE_HITS.inc();
        } else {
            CACHE_MISSES.inc();
        }
        found
    }

    // ttl of None means the configured default
    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }

        let ttl = ttl.unwrap_or(self.default_ttl).min(MAX_TTL);
        let Some(expires_at) = self.clock.now().checked_add(ttl) else {
            tracing::warn!(key, ttl_secs = ttl.as_secs(), "cache expiry out of range, not caching");
            return;
        };
        let entry = CacheEntry { value, expires_at };

        if let Err(e) = self.store.set(key, entry, ttl).await {
            tracing::warn!(key, error = %e, "cache set failed");
            return;
        }

        match self.store.len().await {
            Ok(len) if len > self.max_entries => self.sweep(len).await,
            Ok(len) => CACHE_SIZE.set(len as f64),
            Err(e) => tracing::warn!(error = %e, "cache size lookup failed"),
        }
    }

    // capacity exceeded: expired entries go, live ones stay
    async fn sweep(&self, len: usize) {
        match self.store.purge_expired(self.clock.now()).await {
            Ok(purged) => {
                tracing::debug!(
                    purged,
                    len,
                    max = self.max_entries,
                    "cache over capacity, swept expired entries"
                );
                CACHE_SIZE.set(len.saturating_sub(purged) as f64);
            }
            Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
        }
    }

    pub async fn delete(&self, key: &str) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!(key, error = %e, "cache delete failed");
        }
    }

    pub async fn clear(&self) {
        if !self.enabled {
            return;
        }
        match self.store.clear().await {
            Ok(()) => CACHE_SIZE.set(0.0),
            Err(e) => tracing::warn!(error = %e, "cache clear failed"),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached payload did not decode, dropping it");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => tracing::warn!(key, error = %e, "response did not serialize, not caching"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // counts every call that reaches the store
    #[derive(Debug, Default)]
    struct CountingStore {
        inner: MemoryStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CacheStore for CountingStore {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
            self.touch();
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError> {
            self.touch();
            self.inner.set(key, entry, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.touch();
            self.inner.delete(key).await
        }
        async fn delete_if_expired(&self, key: &str, now: SystemTime) -> Result<bool, CacheError> {
            self.touch();
            self.inner.delete_if_expired(key, now).await
        }
        async fn clear(&self) -> Result<(), CacheError> {
            self.touch();
            self.inner.clear().await
        }
        async fn len(&self) -> Result<usize, CacheError> {
            self.touch();
            self.inner.len().await
        }
        async fn purge_expired(&self, now: SystemTime) -> Result<usize, CacheError> {
            self.touch();
            self.inner.purge_expired(now).await
        }
        fn backend(&self) -> &'static str {
            "counting"
        }
    }

    #[derive(Debug)]
    struct BrokenStore;

    fn broken() -> CacheError {
        CacheError::Serialization(serde_json::from_str::<Value>("{").unwrap_err())
    }

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(broken())
        }
        async fn set(&self, _: &str, _: CacheEntry, _: Duration) -> Result<(), CacheError> {
            Err(broken())
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(broken())
        }
        async fn delete_if_expired(&self, _: &str, _: SystemTime) -> Result<bool, CacheError> {
            Err(broken())
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Err(broken())
        }
        async fn len(&self) -> Result<usize, CacheError> {
            Err(broken())
        }
        async fn purge_expired(&self, _now: SystemTime) -> Result<usize, CacheError> {
            Err(broken())
        }
        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    fn cache_with(store: Arc<dyn CacheStore>, max: usize) -> (ResponseCache, MockClock) {
        let clock = MockClock::at_unix(1_700_000_000);
        let cache = ResponseCache::new(
            true,
            Duration::from_secs(3600),
            max,
            store,
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    #[test]
    fn key_ignores_parameter_order() {
        let a = derive_key("text.generate", &json!({"a": 1, "b": 2}));
        let b = derive_key("text.generate", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);

        let nested_a = derive_key("op", &json!({"outer": {"x": [1, {"q": 1, "p": 2}], "y": null}}));
        let nested_b = derive_key("op", &json!({"outer": {"y": null, "x": [1, {"p": 2, "q": 1}]}}));
        assert_eq!(nested_a, nested_b);
    }

    #[test]
    fn key_depends_on_operation_and_values() {
        let params = json!({"prompt": "hi"});
        assert_ne!(derive_key("text.generate", &params), derive_key("text.complete", &params));
        assert_ne!(
            derive_key("text.generate", &params),
            derive_key("text.generate", &json!({"prompt": "hi!"}))
        );
        assert_eq!(derive_key("op", &params).len(), 64);
    }

    #[tokio::test]
    async fn set_then_get_until_ttl_passes() {
        let (cache, clock) = cache_with(Arc::new(MemoryStore::new()), 10);

        cache.set("k", "v".to_string(), Some(Duration::from_secs(30))).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        clock.advance(Duration::from_secs(29));
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_read() {
        let store = Arc::new(MemoryStore::new());
        let (cache, clock) = cache_with(store.clone(), 10);

        cache.set("k", "v".to_string(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("k").await, None);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn default_ttl_applies_when_none_given() {
        let (cache, clock) = cache_with(Arc::new(MemoryStore::new()), 10);
        cache.set("k", "v".to_string(), None).await;

        clock.advance(Duration::from_secs(3599));
        assert!(cache.get("k").await.is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn overflow_sweeps_only_expired_entries() {
        let store = Arc::new(MemoryStore::new());
        let (cache, clock) = cache_with(store.clone(), 2);

        cache.set("short", "1".to_string(), Some(Duration::from_secs(5))).await;
        cache.set("long", "2".to_string(), Some(Duration::from_secs(500))).await;
        clock.advance(Duration::from_secs(10));

        // third insert exceeds the max, the expired one goes
        cache.set("new", "3".to_string(), None).await;
        assert_eq!(store.len().await.unwrap(), 2);

        // live entries over capacity are tolerated
        cache.set("newer", "4".to_string(), None).await;
        assert_eq!(store.len().await.unwrap(), 3);
        assert_eq!(cache.get("long").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn disabled_cache_never_touches_the_store() {
        let store = Arc::new(CountingStore::default());
        let cache = ResponseCache::new(
            false,
            Duration::from_secs(60),
            10,
            store.clone(),
            Arc::new(MockClock::at_unix(0)),
        );

        cache.set("k", "v".to_string(), None).await;
        cache.set_json("j", &json!({"x": 1}), None).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.get_json::<Value>("j").await, None);
        cache.delete("k").await;
        cache.clear().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failures_degrade_to_miss() {
        let (cache, _clock) = cache_with(Arc::new(BrokenStore), 10);

        cache.set("k", "v".to_string(), None).await;
        assert_eq!(cache.get("k").await, None);
        cache.delete("k").await;
        cache.clear().await;
    }

    #[tokio::test]
    async fn json_helpers_round_trip_and_drop_garbage() {
        let (cache, _clock) = cache_with(Arc::new(MemoryStore::new()), 10);

        cache.set_json("k", &json!({"text": "hello"}), None).await;
        let back: Value = cache.get_json("k").await.unwrap();
        assert_eq!(back["text"], "hello");

        cache.set("bad", "not json".to_string(), None).await;
        assert_eq!(cache.get_json::<Value>("bad").await, None);
        assert_eq!(cache.get("bad").await, None);
    }

    #[tokio::test]
    async fn huge_ttls_are_clamped_not_overflowed() {
        let store = Arc::new(MemoryStore::new());
        let clock = MockClock::at_unix(1_700_000_000);
        let cache = ResponseCache::new(
            true,
            Duration::from_secs(u64::MAX),
            10,
            store.clone(),
            Arc::new(clock.clone()),
        );

        cache.set("k", "v".to_string(), None).await;
        cache.set("j", "w".to_string(), Some(Duration::MAX)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.get("j").await.as_deref(), Some("w"));

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.expires_at, clock.now() + MAX_TTL);
    }

    // hands out an expired entry, then lets a writer slip in before the eviction
    #[derive(Debug)]
    struct RacingStore {
        inner: MemoryStore,
        clock: MockClock,
    }

    #[async_trait]
    impl CacheStore for RacingStore {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
            let stale = self.inner.get(key).await?;
            let fresh = CacheEntry {
                value: "fresh".to_string(),
                expires_at: self.clock.now() + Duration::from_secs(60),
            };
            self.inner.set(key, fresh, Duration::from_secs(60)).await?;
            Ok(stale)
        }
        async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(key, entry, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
        async fn delete_if_expired(&self, key: &str, now: SystemTime) -> Result<bool, CacheError> {
            self.inner.delete_if_expired(key, now).await
        }
        async fn clear(&self) -> Result<(), CacheError> {
            self.inner.clear().await
        }
        async fn len(&self) -> Result<usize, CacheError> {
            self.inner.len().await
        }
        async fn purge_expired(&self, now: SystemTime) -> Result<usize, CacheError> {
            self.inner.purge_expired(now).await
        }
        fn backend(&self) -> &'static str {
            "racing"
        }
    }

    #[tokio::test]
    async fn eviction_keeps_an_entry_rewritten_after_the_read() {
        let clock = MockClock::at_unix(1_700_000_000);
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            clock: clock.clone(),
        });
        let cache = ResponseCache::new(
            true,
            Duration::from_secs(60),
            10,
            store.clone(),
            Arc::new(clock.clone()),
        );

        cache.set("k", "old".to_string(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("k").await, None);

        let kept = store.inner.get("k").await.unwrap().unwrap();
        assert_eq!(kept.value, "fresh");
    }
}
