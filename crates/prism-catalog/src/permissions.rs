use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, OnceLock};

use prism_common::ApiFormat;

use crate::entities::AllowedModels;

const MAX_PATTERN_LENGTH: usize = 200;
const MAX_MODEL_NAME_LENGTH: usize = 200;

/// Normalize an allowed-models config into the set applying to one format.
/// `None` means unrestricted; an empty set rejects everything.
fn allowed_set(allowed: &AllowedModels, format: ApiFormat) -> Option<BTreeSet<&str>> {
    match allowed {
        AllowedModels::List(models) => Some(models.iter().map(String::as_str).collect()),
        AllowedModels::ByFormat(by_format) => {
            let models = by_format
                .get(format.as_str())
                .or_else(|| by_format.get("*"))?;
            Some(models.iter().map(String::as_str).collect())
        }
    }
}

/// Check one model against one whitelist, honoring the global model's
/// regex aliases: an alias matching any whitelisted name admits the model.
pub fn model_allowed(
    model_name: &str,
    resolved_name: Option<&str>,
    allowed: Option<&AllowedModels>,
    format: ApiFormat,
    model_aliases: &[String],
) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let Some(set) = allowed_set(allowed, format) else {
        // Format absent from a by-format config means unrestricted there.
        return true;
    };
    if set.is_empty() {
        return false;
    }
    if set.contains(model_name) {
        return true;
    }
    if let Some(resolved) = resolved_name
        && set.contains(resolved)
    {
        return true;
    }
    for entry in &set {
        for pattern in model_aliases {
            if pattern_matches(pattern, entry) {
                return true;
            }
        }
    }
    false
}

/// Anchored, case-insensitive regex match with a process-wide compile
/// cache. An exact (case-insensitive) string match short-circuits.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern.eq_ignore_ascii_case(name) {
        return true;
    }
    if pattern.len() > MAX_PATTERN_LENGTH || name.len() > MAX_MODEL_NAME_LENGTH {
        return false;
    }
    match compiled(pattern) {
        Some(regex) => regex.is_match(name),
        None => false,
    }
}

fn compiled(pattern: &str) -> Option<regex::Regex> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<regex::Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| {
            regex::RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(true)
                .size_limit(1 << 20)
                .build()
                .inspect_err(|err| {
                    tracing::debug!(pattern, %err, "invalid model alias pattern");
                })
                .ok()
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn none_is_unrestricted() {
        assert!(model_allowed(
            "claude-sonnet-4-5",
            None,
            None,
            ApiFormat::Claude,
            &[]
        ));
    }

    #[test]
    fn empty_list_rejects_all() {
        let allowed = AllowedModels::List(Vec::new());
        assert!(!model_allowed(
            "claude-sonnet-4-5",
            None,
            Some(&allowed),
            ApiFormat::Claude,
            &[]
        ));
    }

    #[test]
    fn resolved_name_matches() {
        let allowed = AllowedModels::List(vec!["claude-sonnet-4-5".to_string()]);
        assert!(model_allowed(
            "sonnet-latest",
            Some("claude-sonnet-4-5"),
            Some(&allowed),
            ApiFormat::Claude,
            &[]
        ));
    }

    #[test]
    fn by_format_with_wildcard_bucket() {
        let mut map = BTreeMap::new();
        map.insert("OPENAI".to_string(), vec!["gpt-4o".to_string()]);
        map.insert("*".to_string(), vec!["fallback-model".to_string()]);
        let allowed = AllowedModels::ByFormat(map);
        assert!(model_allowed(
            "gpt-4o",
            None,
            Some(&allowed),
            ApiFormat::OpenAi,
            &[]
        ));
        assert!(model_allowed(
            "fallback-model",
            None,
            Some(&allowed),
            ApiFormat::Gemini,
            &[]
        ));
        assert!(!model_allowed(
            "gpt-4o",
            None,
            Some(&allowed),
            ApiFormat::Gemini,
            &[]
        ));
    }

    #[test]
    fn alias_pattern_admits_whitelisted_variant() {
        let allowed = AllowedModels::List(vec!["claude-haiku-4-5".to_string()]);
        // The global model's alias pattern covers the whitelisted name.
        assert!(model_allowed(
            "claude-haiku-latest",
            None,
            Some(&allowed),
            ApiFormat::Claude,
            &["claude-haiku-.*".to_string()]
        ));
    }

    #[test]
    fn pattern_matching_is_anchored_and_case_insensitive() {
        assert!(pattern_matches("claude-haiku-.*", "claude-haiku-4.5"));
        assert!(pattern_matches("GPT-4O", "gpt-4o"));
        assert!(!pattern_matches("gpt-4o", "gpt-4"));
        assert!(!pattern_matches("haiku", "claude-haiku-4.5"));
        assert!(!pattern_matches("(", "anything"));
    }
}
