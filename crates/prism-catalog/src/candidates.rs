use std::sync::Arc;

use prism_common::{ApiFormat, EndpointId, KeyId, ProviderId};
use prism_codec::{FormatCompatibility, check_format_compatibility};

use crate::entities::{ClientKey, Endpoint, PriorityMode, Provider, ProviderKey, User};
use crate::permissions::model_allowed;
use crate::resolve::ResolvedModel;
use crate::snapshot::CatalogSnapshot;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<Provider>,
    pub endpoint: Arc<Endpoint>,
    pub key: Arc<ProviderKey>,
    pub needs_conversion: bool,
    pub is_cached: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("no compatible endpoint for this request")]
    NoCompatibleEndpoint,
    #[error("request denied by policy: {0}")]
    ForbiddenByPolicy(&'static str),
}

#[derive(Debug)]
pub struct CandidateQuery<'a> {
    pub user: Option<&'a User>,
    pub client_key: &'a ClientKey,
    pub client_format: ApiFormat,
    pub model_name: &'a str,
    pub resolved: &'a ResolvedModel,
    pub is_stream: bool,
}

/// Enumerate and order every `(provider, endpoint, key)` able to serve the
/// request. Exact-format candidates always precede conversion candidates;
/// inside each group the order follows the active priority mode.
///
/// `breaker_open` reports whether the circuit breaker currently excludes a
/// `(key, format)` pair; the health monitor owns that state.
pub fn build_candidates(
    snapshot: &CatalogSnapshot,
    query: &CandidateQuery<'_>,
    breaker_open: &dyn Fn(KeyId, ApiFormat) -> bool,
) -> Result<Vec<Candidate>, CandidateError> {
    if let Some(formats) = allowed_formats(query)
        && !formats.contains(&query.client_format)
    {
        return Err(CandidateError::ForbiddenByPolicy(
            "api format not allowed for this key",
        ));
    }

    let user_models = query.user.and_then(|u| u.allowed_models.as_ref());
    let key_models = query.client_key.allowed_models.as_ref();
    for (owner, allowed) in [("user", user_models), ("api key", key_models)] {
        if let Some(allowed) = allowed {
            let aliases = snapshot
                .global_model(query.resolved.global_model_id)
                .map(|m| m.model_aliases.clone())
                .unwrap_or_default();
            if !model_allowed(
                query.model_name,
                Some(&query.resolved.name),
                Some(allowed),
                query.client_format,
                &aliases,
            ) {
                tracing::debug!(owner, model = query.model_name, "model denied by policy");
                return Err(CandidateError::ForbiddenByPolicy("model not allowed"));
            }
        }
    }

    let model_aliases = snapshot
        .global_model(query.resolved.global_model_id)
        .map(|m| m.model_aliases.clone())
        .unwrap_or_default();

    let mut out = Vec::new();
    for provider in snapshot.providers.iter().filter(|p| p.enabled) {
        if !provider_allowed(query, provider.id) {
            continue;
        }
        let Some(binding) = snapshot.provider_binding(provider.id, query.resolved.global_model_id)
        else {
            continue;
        };

        for endpoint in snapshot.provider_endpoints(provider.id) {
            let needs_conversion = match check_format_compatibility(
                query.client_format,
                endpoint.api_format,
                endpoint
                    .format_acceptance
                    .as_ref()
                    .map(|acc| codec_acceptance(acc))
                    .as_ref(),
                query.is_stream,
                snapshot.policy.format_conversion_enabled,
            ) {
                FormatCompatibility::Passthrough => false,
                FormatCompatibility::Convert => true,
                FormatCompatibility::Incompatible { .. } => continue,
            };

            for key in snapshot.provider_keys(provider.id) {
                if !key.api_formats.contains(&endpoint.api_format) {
                    continue;
                }
                if breaker_open(key.id, endpoint.api_format) {
                    continue;
                }
                if !model_allowed(
                    &binding.provider_model_name,
                    Some(&query.resolved.name),
                    key.allowed_models.as_ref(),
                    endpoint.api_format,
                    &model_aliases,
                ) {
                    continue;
                }
                out.push(Candidate {
                    provider: Arc::clone(provider),
                    endpoint: Arc::clone(endpoint),
                    key: Arc::clone(key),
                    needs_conversion,
                    is_cached: false,
                });
            }
        }
    }

    if out.is_empty() {
        return Err(CandidateError::NoCompatibleEndpoint);
    }

    let mode = snapshot.policy.priority_mode;
    out.sort_by_key(|c| sort_key(c, mode));
    Ok(out)
}

/// Sort keys. `global_priority = None` sorts after every numeric value in
/// global-key mode.
fn sort_key(candidate: &Candidate, mode: PriorityMode) -> (bool, i64, i64, usize, i64, i64) {
    let global_priority = candidate
        .key
        .global_priority
        .map(i64::from)
        .unwrap_or(i64::MAX);
    match mode {
        PriorityMode::Provider => (
            candidate.needs_conversion,
            i64::from(candidate.provider.priority),
            0,
            candidate.endpoint.api_format.order_index(),
            global_priority,
            i64::from(candidate.key.internal_priority),
        ),
        PriorityMode::GlobalKey => (
            candidate.needs_conversion,
            global_priority,
            i64::from(candidate.provider.priority),
            candidate.endpoint.api_format.order_index(),
            0,
            i64::from(candidate.key.internal_priority),
        ),
    }
}

/// Move the affinity target, when present in the list, to the head.
pub fn promote_affinity(
    candidates: &mut Vec<Candidate>,
    target: (ProviderId, EndpointId, KeyId),
) -> bool {
    let position = candidates.iter().position(|c| {
        (c.provider.id, c.endpoint.id, c.key.id) == target
    });
    match position {
        Some(index) => {
            let mut cached = candidates.remove(index);
            cached.is_cached = true;
            candidates.insert(0, cached);
            true
        }
        None => false,
    }
}

fn provider_allowed(query: &CandidateQuery<'_>, provider_id: ProviderId) -> bool {
    let user_ok = query
        .user
        .and_then(|u| u.allowed_providers.as_ref())
        .is_none_or(|allowed| allowed.contains(&provider_id));
    let key_ok = query
        .client_key
        .allowed_providers
        .as_ref()
        .is_none_or(|allowed| allowed.contains(&provider_id));
    user_ok && key_ok
}

fn allowed_formats(query: &CandidateQuery<'_>) -> Option<Vec<ApiFormat>> {
    let user = query.user.and_then(|u| u.allowed_api_formats.clone());
    let key = query.client_key.allowed_api_formats.clone();
    match (user, key) {
        (None, None) => None,
        (Some(u), None) => Some(u),
        (None, Some(k)) => Some(k),
        (Some(u), Some(k)) => Some(u.into_iter().filter(|f| k.contains(f)).collect()),
    }
}

fn codec_acceptance(
    acceptance: &crate::entities::FormatAcceptance,
) -> prism_codec::FormatAcceptance {
    prism_codec::FormatAcceptance {
        enabled: acceptance.enabled,
        accept_formats: acceptance.accept_formats.clone(),
        reject_formats: acceptance.reject_formats.clone(),
        stream_conversion: acceptance.stream_conversion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        BillingType, FormatAcceptance, GatewayPolicy, GlobalModel, KeyAuthKind, ModelBinding,
        ModelCapabilities,
    };

    fn provider(id: i64, priority: i32) -> Arc<Provider> {
        Arc::new(Provider {
            id,
            name: format!("p{id}"),
            priority,
            billing_type: BillingType::PayAsYouGo,
            monthly_quota_usd: None,
            quota_reset_day: None,
            monthly_used_usd: 0.0,
            enabled: true,
        })
    }

    fn endpoint(id: i64, provider_id: i64, format: ApiFormat, convertible: bool) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            id,
            provider_id,
            api_format: format,
            base_url: "https://upstream.example".to_string(),
            custom_path: None,
            static_headers: Vec::new(),
            header_rules: Vec::new(),
            timeout_secs: 120,
            max_retries: 1,
            format_acceptance: convertible.then(|| FormatAcceptance {
                enabled: true,
                accept_formats: Vec::new(),
                reject_formats: Vec::new(),
                stream_conversion: true,
            }),
            enabled: true,
        })
    }

    fn key(id: i64, provider_id: i64, formats: &[ApiFormat]) -> Arc<ProviderKey> {
        Arc::new(ProviderKey {
            id,
            provider_id,
            secret: format!("sk-upstream-{id}"),
            auth_kind: KeyAuthKind::ApiKey,
            api_formats: formats.to_vec(),
            internal_priority: 0,
            global_priority: None,
            rpm_limit: None,
            learned_rpm_limit: None,
            cache_ttl_minutes: None,
            rate_multiplier: None,
            allowed_models: None,
            enabled: true,
        })
    }

    fn key_with_priorities(
        id: i64,
        provider_id: i64,
        format: ApiFormat,
        internal: i32,
        global: Option<i32>,
    ) -> Arc<ProviderKey> {
        let mut k = (*key(id, provider_id, &[format])).clone();
        k.internal_priority = internal;
        k.global_priority = global;
        Arc::new(k)
    }

    fn client_key() -> ClientKey {
        ClientKey {
            id: 1,
            user_id: Some(1),
            key_hash: "hash".to_string(),
            standalone: false,
            balance_usd: None,
            balance_used_usd: 0.0,
            allowed_providers: None,
            allowed_api_formats: None,
            allowed_models: None,
            enabled: true,
        }
    }

    fn binding(provider_id: i64) -> Arc<ModelBinding> {
        Arc::new(ModelBinding {
            id: provider_id,
            provider_id,
            global_model_id: 1,
            provider_model_name: "claude-sonnet-4-5".to_string(),
            aliases: Vec::new(),
            pricing: None,
            billing_template: None,
            enabled: true,
        })
    }

    fn global_model() -> Arc<GlobalModel> {
        Arc::new(GlobalModel {
            id: 1,
            name: "claude-sonnet-4-5".to_string(),
            display_name: "Claude Sonnet".to_string(),
            capabilities: ModelCapabilities::default(),
            model_aliases: Vec::new(),
            pricing: None,
            enabled: true,
        })
    }

    fn resolved() -> ResolvedModel {
        ResolvedModel {
            global_model_id: 1,
            name: "claude-sonnet-4-5".to_string(),
        }
    }

    fn no_breaker(_: KeyId, _: ApiFormat) -> bool {
        false
    }

    #[test]
    fn exact_match_precedes_conversion() {
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 5), provider(2, 1)],
            endpoints: vec![
                // Lower-priority provider has the native endpoint; the
                // higher-priority provider only offers conversion.
                endpoint(10, 1, ApiFormat::Claude, false),
                endpoint(20, 2, ApiFormat::OpenAi, true),
            ],
            keys: vec![
                key(100, 1, &[ApiFormat::Claude]),
                key(200, 2, &[ApiFormat::OpenAi]),
            ],
            bindings: vec![binding(1), binding(2)],
            policy: GatewayPolicy::default(),
            ..CatalogSnapshot::default()
        };
        let ck = client_key();
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: true,
        };
        let candidates = build_candidates(&snapshot, &query, &no_breaker).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[0].needs_conversion);
        assert_eq!(candidates[0].provider.id, 1);
        assert!(candidates[1].needs_conversion);
    }

    #[test]
    fn within_group_orders_by_provider_then_key_priority() {
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 2), provider(2, 1)],
            endpoints: vec![
                endpoint(10, 1, ApiFormat::Claude, false),
                endpoint(20, 2, ApiFormat::Claude, false),
            ],
            keys: vec![
                key_with_priorities(100, 1, ApiFormat::Claude, 0, None),
                key_with_priorities(201, 2, ApiFormat::Claude, 2, None),
                key_with_priorities(202, 2, ApiFormat::Claude, 1, None),
            ],
            bindings: vec![binding(1), binding(2)],
            policy: GatewayPolicy::default(),
            ..CatalogSnapshot::default()
        };
        let ck = client_key();
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: false,
        };
        let candidates = build_candidates(&snapshot, &query, &no_breaker).unwrap();
        let ids: Vec<i64> = candidates.iter().map(|c| c.key.id).collect();
        assert_eq!(ids, vec![202, 201, 100]);
    }

    #[test]
    fn global_key_mode_ranks_across_providers_with_none_last() {
        let mut policy = GatewayPolicy::default();
        policy.priority_mode = PriorityMode::GlobalKey;
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 1), provider(2, 2)],
            endpoints: vec![
                endpoint(10, 1, ApiFormat::Claude, false),
                endpoint(20, 2, ApiFormat::Claude, false),
            ],
            keys: vec![
                key_with_priorities(100, 1, ApiFormat::Claude, 0, None),
                key_with_priorities(200, 2, ApiFormat::Claude, 0, Some(1)),
            ],
            bindings: vec![binding(1), binding(2)],
            policy,
            ..CatalogSnapshot::default()
        };
        let ck = client_key();
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: false,
        };
        let candidates = build_candidates(&snapshot, &query, &no_breaker).unwrap();
        // Numbered global priority beats None even on a worse provider.
        assert_eq!(candidates[0].key.id, 200);
        assert_eq!(candidates[1].key.id, 100);
    }

    #[test]
    fn breaker_excludes_key_for_format() {
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 1)],
            endpoints: vec![endpoint(10, 1, ApiFormat::Claude, false)],
            keys: vec![key(100, 1, &[ApiFormat::Claude])],
            bindings: vec![binding(1)],
            policy: GatewayPolicy::default(),
            ..CatalogSnapshot::default()
        };
        let ck = client_key();
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: false,
        };
        let open = |key_id: KeyId, format: ApiFormat| {
            key_id == 100 && format == ApiFormat::Claude
        };
        assert_eq!(
            build_candidates(&snapshot, &query, &open),
            Err(CandidateError::NoCompatibleEndpoint)
        );
    }

    #[test]
    fn policy_denies_disallowed_provider() {
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 1)],
            endpoints: vec![endpoint(10, 1, ApiFormat::Claude, false)],
            keys: vec![key(100, 1, &[ApiFormat::Claude])],
            bindings: vec![binding(1)],
            policy: GatewayPolicy::default(),
            ..CatalogSnapshot::default()
        };
        let mut ck = client_key();
        ck.allowed_providers = Some(vec![99]);
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: false,
        };
        assert_eq!(
            build_candidates(&snapshot, &query, &no_breaker),
            Err(CandidateError::NoCompatibleEndpoint)
        );
    }

    #[test]
    fn affinity_promotion_moves_candidate_to_head() {
        let snapshot = CatalogSnapshot {
            global_models: vec![global_model()],
            providers: vec![provider(1, 1), provider(2, 2)],
            endpoints: vec![
                endpoint(10, 1, ApiFormat::Claude, false),
                endpoint(20, 2, ApiFormat::Claude, false),
            ],
            keys: vec![
                key(100, 1, &[ApiFormat::Claude]),
                key(200, 2, &[ApiFormat::Claude]),
            ],
            bindings: vec![binding(1), binding(2)],
            policy: GatewayPolicy::default(),
            ..CatalogSnapshot::default()
        };
        let ck = client_key();
        let resolved = resolved();
        let query = CandidateQuery {
            user: None,
            client_key: &ck,
            client_format: ApiFormat::Claude,
            model_name: "claude-sonnet-4-5",
            resolved: &resolved,
            is_stream: false,
        };
        let mut candidates = build_candidates(&snapshot, &query, &no_breaker).unwrap();
        assert_eq!(candidates[0].key.id, 100);
        assert!(promote_affinity(&mut candidates, (2, 20, 200)));
        assert_eq!(candidates[0].key.id, 200);
        assert!(candidates[0].is_cached);
        assert!(!promote_affinity(&mut candidates, (9, 9, 9)));
    }
}
