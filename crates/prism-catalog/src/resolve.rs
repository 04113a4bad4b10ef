use serde::{Deserialize, Serialize};

use prism_common::GlobalModelId;

use crate::permissions::pattern_matches;
use crate::snapshot::CatalogSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub global_model_id: GlobalModelId,
    /// Canonical `GlobalModel.name`.
    pub name: String,
}

/// Resolve a user-facing model identifier to a GlobalModel.
///
/// Order: exact name, binding provider-model name, binding alias, global
/// model regex alias. Ambiguity picks the lexicographically first name and
/// logs a conflict warning.
pub fn resolve_model_name(snapshot: &CatalogSnapshot, model_name: &str) -> Option<ResolvedModel> {
    let enabled = || snapshot.global_models.iter().filter(|m| m.enabled);

    if let Some(model) = enabled().find(|m| m.name == model_name) {
        return Some(ResolvedModel {
            global_model_id: model.id,
            name: model.name.clone(),
        });
    }

    let mut matches: Vec<ResolvedModel> = Vec::new();
    let mut push = |id: GlobalModelId, name: &str| {
        if !matches.iter().any(|m| m.global_model_id == id) {
            matches.push(ResolvedModel {
                global_model_id: id,
                name: name.to_string(),
            });
        }
    };

    for binding in snapshot.bindings.iter().filter(|b| b.enabled) {
        if binding.provider_model_name == model_name {
            if let Some(model) = snapshot.global_model(binding.global_model_id) {
                push(model.id, &model.name);
            }
        }
    }

    if matches.is_empty() {
        for binding in snapshot.bindings.iter().filter(|b| b.enabled) {
            if binding.aliases.iter().any(|alias| alias == model_name) {
                if let Some(model) = snapshot.global_model(binding.global_model_id) {
                    push(model.id, &model.name);
                }
            }
        }
    }

    if matches.is_empty() {
        for model in enabled() {
            if model
                .model_aliases
                .iter()
                .any(|pattern| pattern_matches(pattern, model_name))
            {
                push(model.id, &model.name);
            }
        }
    }

    if matches.len() > 1 {
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::warn!(
            model_name,
            candidates = matches.len(),
            winner = %matches[0].name,
            "ambiguous model resolution",
        );
    }
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entities::{GlobalModel, ModelBinding, ModelCapabilities};

    fn model(id: i64, name: &str, aliases: &[&str]) -> Arc<GlobalModel> {
        Arc::new(GlobalModel {
            id,
            name: name.to_string(),
            display_name: name.to_string(),
            capabilities: ModelCapabilities::default(),
            model_aliases: aliases.iter().map(|s| s.to_string()).collect(),
            pricing: None,
            enabled: true,
        })
    }

    fn binding(provider_id: i64, global_model_id: i64, name: &str, aliases: &[&str]) -> Arc<ModelBinding> {
        Arc::new(ModelBinding {
            id: global_model_id * 10 + provider_id,
            provider_id,
            global_model_id,
            provider_model_name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            pricing: None,
            billing_template: None,
            enabled: true,
        })
    }

    fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot {
            global_models: vec![
                model(1, "claude-sonnet-4-5", &["claude-sonnet-.*"]),
                model(2, "gpt-4o", &[]),
            ],
            bindings: vec![
                binding(1, 1, "anthropic/claude-sonnet-4-5", &["sonnet-latest"]),
                binding(2, 2, "gpt-4o-2024-11-20", &[]),
            ],
            ..CatalogSnapshot::default()
        }
    }

    #[test]
    fn exact_name_wins() {
        let resolved = resolve_model_name(&snapshot(), "claude-sonnet-4-5").unwrap();
        assert_eq!(resolved.global_model_id, 1);
    }

    #[test]
    fn provider_model_name_resolves() {
        let resolved = resolve_model_name(&snapshot(), "gpt-4o-2024-11-20").unwrap();
        assert_eq!(resolved.global_model_id, 2);
    }

    #[test]
    fn binding_alias_resolves() {
        let resolved = resolve_model_name(&snapshot(), "sonnet-latest").unwrap();
        assert_eq!(resolved.global_model_id, 1);
        assert_eq!(resolved.name, "claude-sonnet-4-5");
    }

    #[test]
    fn regex_alias_resolves() {
        let resolved = resolve_model_name(&snapshot(), "claude-sonnet-next").unwrap();
        assert_eq!(resolved.global_model_id, 1);
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(resolve_model_name(&snapshot(), "llama-70b").is_none());
    }
}
