use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use prism_catalog::{
    CatalogHandle, CatalogSnapshot, ClientKey, Endpoint, GatewayPolicy, GlobalModel, ModelBinding,
    Provider, ProviderKey, User,
};

/// On-disk shape of the declarative catalog. Administration happens
/// outside the gateway; this file is the handoff format.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    global_models: Vec<GlobalModel>,
    #[serde(default)]
    providers: Vec<Provider>,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    keys: Vec<ProviderKey>,
    #[serde(default)]
    bindings: Vec<ModelBinding>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    client_keys: Vec<ClientKey>,
    #[serde(default)]
    policy: Option<GatewayPolicy>,
}

pub fn load(path: &Path) -> anyhow::Result<CatalogHandle> {
    let raw = std::fs::read_to_string(path)?;
    let file: CatalogFile = serde_json::from_str(&raw)?;

    let snapshot = CatalogSnapshot {
        global_models: file.global_models.into_iter().map(Arc::new).collect(),
        providers: file.providers.into_iter().map(Arc::new).collect(),
        endpoints: file.endpoints.into_iter().map(Arc::new).collect(),
        keys: file.keys.into_iter().map(Arc::new).collect(),
        bindings: file.bindings.into_iter().map(Arc::new).collect(),
        users: file.users.into_iter().map(Arc::new).collect(),
        client_keys: file.client_keys.into_iter().map(Arc::new).collect(),
        policy: file.policy.unwrap_or_default(),
    };

    tracing::info!(
        models = snapshot.global_models.len(),
        providers = snapshot.providers.len(),
        endpoints = snapshot.endpoints.len(),
        keys = snapshot.keys.len(),
        "catalog loaded",
    );
    Ok(CatalogHandle::new(snapshot))
}
