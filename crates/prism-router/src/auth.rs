use std::sync::Arc;

use http::HeaderMap;

use prism_catalog::CatalogSnapshot;
use prism_common::ApiFormat;
use prism_core::AuthContext;

/// Client keys are stored as blake3 hex digests; the plaintext never
/// leaves the request scope.
pub fn hash_client_key(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

/// Pull the client credential out of the dialect's auth surface.
///
/// The auth header also disambiguates CLI variants: a Claude request
/// arriving with `Authorization: Bearer` is the CLI entry point.
pub fn extract_client_key(
    format: ApiFormat,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<(String, ApiFormat)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(String::from)
    };
    let bearer = || {
        header("authorization").and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .map(|token| token.trim().to_string())
        })
    };

    match format {
        ApiFormat::Claude | ApiFormat::ClaudeCli => {
            if let Some(key) = header("x-api-key") {
                return Some((key, ApiFormat::Claude));
            }
            bearer().map(|key| (key, ApiFormat::ClaudeCli))
        }
        ApiFormat::OpenAi => bearer().map(|key| (key, ApiFormat::OpenAi)),
        ApiFormat::OpenAiCli => bearer().map(|key| (key, ApiFormat::OpenAiCli)),
        ApiFormat::Gemini | ApiFormat::GeminiCli => {
            if let Some(key) = header("x-goog-api-key") {
                return Some((key, ApiFormat::Gemini));
            }
            let query = query.unwrap_or("");
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("key="))
                .filter(|key| !key.is_empty())
                .map(|key| (key.to_string(), ApiFormat::Gemini))
        }
    }
}

/// Match the presented key against the catalog and assemble the policy
/// context the candidate builder narrows with.
pub fn authenticate(snapshot: &CatalogSnapshot, presented: &str) -> Option<AuthContext> {
    let hash = hash_client_key(presented);
    let client_key = snapshot
        .client_keys
        .iter()
        .find(|key| key.enabled && key.key_hash == hash)?;
    let user = match client_key.user_id {
        Some(user_id) => {
            let user = snapshot.user(user_id).filter(|user| user.enabled)?;
            Some(Arc::clone(user))
        }
        None => None,
    };
    Some(AuthContext {
        user,
        client_key: Arc::clone(client_key),
    })
}

/// Pre-dispatch quota gate: reads only, the hard stop is the conditional
/// decrement at recording time.
pub fn quota_available(auth: &AuthContext) -> bool {
    if auth.client_key.standalone {
        return match auth.client_key.balance_usd {
            Some(balance) => auth.client_key.balance_used_usd < balance,
            None => true,
        };
    }
    match auth.user.as_ref() {
        Some(user) => match user.quota_usd {
            Some(quota) if quota >= 0.0 => user.used_usd < quota,
            _ => true,
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use prism_catalog::ClientKey;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn claude_header_beats_bearer() {
        let headers = headers(&[("x-api-key", "sk-a"), ("authorization", "Bearer sk-b")]);
        let (key, format) = extract_client_key(ApiFormat::Claude, &headers, None).unwrap();
        assert_eq!(key, "sk-a");
        assert_eq!(format, ApiFormat::Claude);
    }

    #[test]
    fn claude_bearer_selects_cli_entry() {
        let headers = headers(&[("authorization", "Bearer sk-cli")]);
        let (key, format) = extract_client_key(ApiFormat::Claude, &headers, None).unwrap();
        assert_eq!(key, "sk-cli");
        assert_eq!(format, ApiFormat::ClaudeCli);
    }

    #[test]
    fn gemini_accepts_query_key() {
        let headers = HeaderMap::new();
        let (key, _) =
            extract_client_key(ApiFormat::Gemini, &headers, Some("alt=sse&key=sk-g")).unwrap();
        assert_eq!(key, "sk-g");
    }

    #[test]
    fn authenticate_matches_hash() {
        let secret = "sk-client-X";
        let snapshot = CatalogSnapshot {
            client_keys: vec![Arc::new(ClientKey {
                id: 1,
                user_id: None,
                key_hash: hash_client_key(secret),
                standalone: false,
                balance_usd: None,
                balance_used_usd: 0.0,
                allowed_providers: None,
                allowed_api_formats: None,
                allowed_models: None,
                enabled: true,
            })],
            ..CatalogSnapshot::default()
        };
        assert!(authenticate(&snapshot, secret).is_some());
        assert!(authenticate(&snapshot, "sk-wrong").is_none());
    }
}
