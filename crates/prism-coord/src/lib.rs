mod affinity;
mod memory;
mod redis_store;
mod rpm;

use std::time::Duration;

use async_trait::async_trait;

pub use affinity::{AffinityKey, AffinityRecord, AffinityStore};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use rpm::{
    ReservationConfig, ReservationPhase, ReservationResult, RpmAdmission, RpmGuard,
    RpmGuardConfig, calculate_reservation,
};

use prism_catalog::ResolvedModel;

pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Minimal key-value surface the coordination primitives are built on.
/// Production uses Redis; tests use `MemoryStore`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomic increment; the TTL is applied when the key is created.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoordResult<i64>;
    async fn get_i64(&self, key: &str) -> CoordResult<Option<i64>>;
    async fn get_string(&self, key: &str) -> CoordResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()>;
    async fn delete(&self, key: &str) -> CoordResult<()>;
    /// Glob-style key scan (`affinity:*`). Not used on the hot path.
    async fn scan_keys(&self, pattern: &str) -> CoordResult<Vec<String>>;
}

pub mod keys {
    use prism_common::{ApiFormat, ApiKeyId, GlobalModelId, KeyId};

    pub fn rpm_counter(key_id: KeyId) -> String {
        format!("rpm:{key_id}")
    }

    /// Lifetime request counter feeding the reservation phase decision.
    pub fn rpm_observed(key_id: KeyId) -> String {
        format!("rpm:observed:{key_id}")
    }

    pub fn affinity(
        client_api_key_id: ApiKeyId,
        target_format: ApiFormat,
        global_model_id: GlobalModelId,
    ) -> String {
        format!(
            "affinity:{client_api_key_id}:{}:{global_model_id}",
            target_format.as_str()
        )
    }

    pub fn affinity_prefix() -> &'static str {
        "affinity:"
    }

    pub fn model_resolution(name: &str) -> String {
        format!("global_model:resolve:{name}")
    }
}

/// Redis-backed model-resolution cache (bounded TTL, shared by workers).
pub struct ResolveCache<S: CoordinationStore + ?Sized> {
    store: std::sync::Arc<S>,
    ttl: Duration,
}

impl<S: CoordinationStore + ?Sized> ResolveCache<S> {
    pub fn new(store: std::sync::Arc<S>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn get(&self, model_name: &str) -> Option<ResolvedModel> {
        let key = keys::model_resolution(model_name);
        match self.store.get_string(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, model_name, "model resolution cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, model_name: &str, resolved: &ResolvedModel) {
        let key = keys::model_resolution(model_name);
        let Ok(raw) = serde_json::to_string(resolved) else {
            return;
        };
        if let Err(err) = self.store.set_ex(&key, &raw, self.ttl).await {
            tracing::warn!(%err, model_name, "model resolution cache write failed");
        }
    }
}
