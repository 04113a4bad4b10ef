use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{CoordResult, CoordinationStore};

/// In-process store with the same TTL semantics as the Redis backend.
/// Used in tests and as a degraded single-worker fallback.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoordResult<i64> {
        let mut entries = self.entries.lock().await;
        let next = match entries.get(key) {
            Some(entry) if entry.live() => entry.value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let expires_at = if next == 1 {
            Some(Instant::now() + ttl)
        } else {
            entries.get(key).and_then(|e| e.expires_at)
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get_i64(&self, key: &str) -> CoordResult<Option<i64>> {
        Ok(self
            .get_string(key)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    async fn get_string(&self, key: &str) -> CoordResult<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> CoordResult<Vec<String>> {
        let entries = self.entries.lock().await;
        let prefix = pattern.trim_end_matches('*');
        Ok(entries
            .iter()
            .filter(|(key, entry)| entry.live() && key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
