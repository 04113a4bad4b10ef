use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use prism_common::{ApiFormat, ApiKeyId, EndpointId, GlobalModelId, KeyId, ProviderId};

use crate::{CoordResult, CoordinationStore, keys};

/// Sticky-routing key: one client identity asking for one model through
/// one target dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityKey {
    pub client_api_key_id: ApiKeyId,
    pub target_format: ApiFormat,
    pub global_model_id: GlobalModelId,
}

impl AffinityKey {
    fn redis_key(&self) -> String {
        keys::affinity(
            self.client_api_key_id,
            self.target_format,
            self.global_model_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRecord {
    pub provider_id: ProviderId,
    pub endpoint_id: EndpointId,
    pub key_id: KeyId,
    pub created_at: i64,
    pub expire_at: i64,
    pub request_count: u64,
}

impl AffinityRecord {
    pub fn target(&self) -> (ProviderId, EndpointId, KeyId) {
        (self.provider_id, self.endpoint_id, self.key_id)
    }
}

/// Redis-held sticky routing records. Writes happen only after a
/// successful attempt; reads are a soft hint and failures degrade to the
/// normal candidate order.
pub struct AffinityStore {
    store: Arc<dyn CoordinationStore>,
}

impl AffinityStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &AffinityKey) -> Option<AffinityRecord> {
        match self.store.get_string(&key.redis_key()).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, "affinity read failed");
                None
            }
        }
    }

    /// Store or refresh the sticky target after a successful request.
    pub async fn put(
        &self,
        key: &AffinityKey,
        target: (ProviderId, EndpointId, KeyId),
        ttl: Duration,
    ) -> CoordResult<()> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let previous = self.get(key).await;
        let record = AffinityRecord {
            provider_id: target.0,
            endpoint_id: target.1,
            key_id: target.2,
            created_at: previous
                .as_ref()
                .filter(|p| p.target() == target)
                .map(|p| p.created_at)
                .unwrap_or(now),
            expire_at: now + ttl.as_secs() as i64,
            request_count: previous
                .filter(|p| p.target() == target)
                .map(|p| p.request_count + 1)
                .unwrap_or(1),
        };
        let raw = serde_json::to_string(&record)?;
        self.store.set_ex(&key.redis_key(), &raw, ttl).await
    }

    pub async fn invalidate(&self, key: &AffinityKey) -> CoordResult<()> {
        self.store.delete(&key.redis_key()).await
    }

    pub async fn invalidate_provider(&self, provider_id: ProviderId) -> CoordResult<usize> {
        self.invalidate_matching(|record| record.provider_id == provider_id)
            .await
    }

    pub async fn invalidate_key(&self, key_id: KeyId) -> CoordResult<usize> {
        self.invalidate_matching(|record| record.key_id == key_id)
            .await
    }

    pub async fn invalidate_endpoint(&self, endpoint_id: EndpointId) -> CoordResult<usize> {
        self.invalidate_matching(|record| record.endpoint_id == endpoint_id)
            .await
    }

    /// Admin view of every live affinity.
    pub async fn list_all(&self) -> CoordResult<Vec<(String, AffinityRecord)>> {
        let pattern = format!("{}*", keys::affinity_prefix());
        let mut out = Vec::new();
        for key in self.store.scan_keys(&pattern).await? {
            if let Some(raw) = self.store.get_string(&key).await?
                && let Ok(record) = serde_json::from_str::<AffinityRecord>(&raw)
            {
                out.push((key, record));
            }
        }
        Ok(out)
    }

    async fn invalidate_matching(
        &self,
        matches: impl Fn(&AffinityRecord) -> bool,
    ) -> CoordResult<usize> {
        let mut removed = 0;
        for (key, record) in self.list_all().await? {
            if matches(&record) {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn affinity_key(client: ApiKeyId) -> AffinityKey {
        AffinityKey {
            client_api_key_id: client,
            target_format: ApiFormat::Claude,
            global_model_id: 1,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = AffinityStore::new(Arc::new(MemoryStore::new()));
        let key = affinity_key(1);
        store
            .put(&key, (10, 20, 30), Duration::from_secs(60))
            .await
            .unwrap();
        let record = store.get(&key).await.unwrap();
        assert_eq!(record.target(), (10, 20, 30));
        assert_eq!(record.request_count, 1);
    }

    #[tokio::test]
    async fn refresh_increments_request_count() {
        let store = AffinityStore::new(Arc::new(MemoryStore::new()));
        let key = affinity_key(1);
        for _ in 0..3 {
            store
                .put(&key, (10, 20, 30), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.get(&key).await.unwrap().request_count, 3);

        // Switching targets restarts the count.
        store
            .put(&key, (11, 21, 31), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn provider_invalidation_clears_matching_records() {
        let store = AffinityStore::new(Arc::new(MemoryStore::new()));
        let a = affinity_key(1);
        let b = affinity_key(2);
        store.put(&a, (10, 20, 30), Duration::from_secs(60)).await.unwrap();
        store.put(&b, (11, 21, 31), Duration::from_secs(60)).await.unwrap();

        let removed = store.invalidate_provider(10).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&a).await.is_none());
        assert!(store.get(&b).await.is_some());
    }

    #[tokio::test]
    async fn key_invalidation_clears_matching_records() {
        let store = AffinityStore::new(Arc::new(MemoryStore::new()));
        let a = affinity_key(1);
        store.put(&a, (10, 20, 30), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.invalidate_key(30).await.unwrap(), 1);
        assert!(store.get(&a).await.is_none());
    }
}
