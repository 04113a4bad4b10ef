use std::sync::Arc;

use arc_swap::ArcSwap;

use prism_common::{ApiKeyId, EndpointId, GlobalModelId, KeyId, ProviderId, UserId};

use crate::entities::{
    ClientKey, Endpoint, GatewayPolicy, GlobalModel, ModelBinding, Provider, ProviderKey, User,
};

/// Immutable catalog view. Request handling never mutates it; the admin
/// surface swaps whole snapshots in.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub global_models: Vec<Arc<GlobalModel>>,
    pub providers: Vec<Arc<Provider>>,
    pub endpoints: Vec<Arc<Endpoint>>,
    pub keys: Vec<Arc<ProviderKey>>,
    pub bindings: Vec<Arc<ModelBinding>>,
    pub users: Vec<Arc<User>>,
    pub client_keys: Vec<Arc<ClientKey>>,
    pub policy: GatewayPolicy,
}

impl CatalogSnapshot {
    pub fn global_model(&self, id: GlobalModelId) -> Option<&Arc<GlobalModel>> {
        self.global_models.iter().find(|m| m.id == id)
    }

    pub fn provider(&self, id: ProviderId) -> Option<&Arc<Provider>> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn key(&self, id: KeyId) -> Option<&Arc<ProviderKey>> {
        self.keys.iter().find(|k| k.id == id)
    }

    pub fn user(&self, id: UserId) -> Option<&Arc<User>> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn client_key(&self, id: ApiKeyId) -> Option<&Arc<ClientKey>> {
        self.client_keys.iter().find(|k| k.id == id)
    }

    pub fn provider_endpoints(&self, provider_id: ProviderId) -> Vec<&Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.provider_id == provider_id && e.enabled)
            .collect()
    }

    pub fn provider_keys(&self, provider_id: ProviderId) -> Vec<&Arc<ProviderKey>> {
        self.keys
            .iter()
            .filter(|k| k.provider_id == provider_id && k.enabled)
            .collect()
    }

    pub fn provider_binding(
        &self,
        provider_id: ProviderId,
        global_model_id: GlobalModelId,
    ) -> Option<&Arc<ModelBinding>> {
        self.bindings.iter().find(|b| {
            b.enabled && b.provider_id == provider_id && b.global_model_id == global_model_id
        })
    }
}

/// Shared handle over the current snapshot (lock-free reads).
#[derive(Clone)]
pub struct CatalogHandle {
    inner: Arc<ArcSwap<CatalogSnapshot>>,
}

impl CatalogHandle {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(Arc::new(snapshot))),
        }
    }

    pub fn load(&self) -> Arc<CatalogSnapshot> {
        self.inner.load_full()
    }

    pub fn replace(&self, snapshot: CatalogSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

impl std::fmt::Debug for CatalogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.load();
        f.debug_struct("CatalogHandle")
            .field("providers", &snapshot.providers.len())
            .field("endpoints", &snapshot.endpoints.len())
            .field("keys", &snapshot.keys.len())
            .field("models", &snapshot.global_models.len())
            .finish()
    }
}
