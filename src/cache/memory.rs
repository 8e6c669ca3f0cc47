use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, SystemTime};

use super::{CacheEntry, CacheError, CacheStore};

// In-process store, the default backing
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>, // key -> entry
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, _ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    // the check and the removal happen under the same shard lock
    async fn delete_if_expired(&self, key: &str, now: SystemTime) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now))
            .is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.len())
    }

    async fn purge_expired(&self, now: SystemTime) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
