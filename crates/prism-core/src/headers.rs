use prism_catalog::{Endpoint, HeaderRule, KeyAuthKind, ProviderKey};
use prism_common::{
    ApiFormat, AuthStyle, Headers, format_definition, header_remove, header_set, strip_hop_by_hop,
};

/// Build the upstream header set: format extras, endpoint static headers,
/// endpoint header rules (set, then drop, then rename), and finally the
/// credential. Protected keys cannot be clobbered by rules, and the auth
/// header always wins.
pub fn build_upstream_headers(endpoint: &Endpoint, key: &ProviderKey) -> Headers {
    let definition = format_definition(endpoint.api_format);
    let mut headers: Headers = vec![("content-type".to_string(), "application/json".to_string())];

    for (name, value) in definition.extra_headers {
        header_set(&mut headers, *name, *value);
    }
    for (name, value) in &endpoint.static_headers {
        header_set(&mut headers, name.clone(), value.clone());
    }

    let protected = definition.protected_keys;
    let is_protected = |name: &str| protected.contains(&name.to_ascii_lowercase().as_str());

    for rule in &endpoint.header_rules {
        if let HeaderRule::Set { name, value } = rule
            && !is_protected(name)
        {
            header_set(&mut headers, name.clone(), value.clone());
        }
    }
    for rule in &endpoint.header_rules {
        if let HeaderRule::Drop { name } = rule
            && !is_protected(name)
        {
            header_remove(&mut headers, name);
        }
    }
    for rule in &endpoint.header_rules {
        if let HeaderRule::Rename { from, to } = rule
            && !is_protected(from)
            && !is_protected(to)
            && let Some(value) = header_remove(&mut headers, from)
        {
            header_set(&mut headers, to.clone(), value);
        }
    }

    match key.auth_kind {
        KeyAuthKind::ApiKey => match definition.auth_style {
            AuthStyle::Header => {
                header_set(&mut headers, definition.auth_header, key.secret.clone());
            }
            AuthStyle::Bearer => {
                header_set(&mut headers, "authorization", format!("Bearer {}", key.secret));
            }
        },
        // OAuth credentials always ride the Authorization header,
        // regardless of the format's natural auth style.
        KeyAuthKind::OAuth => {
            header_remove(&mut headers, definition.auth_header);
            header_set(&mut headers, "authorization", format!("Bearer {}", key.secret));
        }
    }

    strip_hop_by_hop(&mut headers);
    headers
}

/// Upstream URL for one attempt. Gemini carries the model and action in
/// the path (with `alt=sse` for streamed calls); everyone else posts to a
/// fixed path and carries the model in the body.
pub fn build_upstream_url(
    endpoint: &Endpoint,
    target_model: &str,
    is_stream: bool,
) -> String {
    let definition = format_definition(endpoint.api_format);
    let path = endpoint
        .custom_path
        .clone()
        .unwrap_or_else(|| definition.default_path.to_string());

    let path = if path.contains("{model}") {
        let action = if is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut path = path
            .replace("{model}", target_model)
            .replace("{action}", action);
        if is_stream {
            path.push_str("?alt=sse");
        }
        path
    } else {
        path
    };

    let base = endpoint.base_url.trim_end_matches('/');
    format!("{}{}", base, path)
}

/// Rewrite the model field inside a passthrough body when the provider
/// knows the model under a different name. Gemini bodies carry no model.
pub fn rewrite_model_in_body(
    body: &serde_json::Value,
    target_format: ApiFormat,
    target_model: &str,
) -> serde_json::Value {
    let definition = format_definition(target_format);
    let mut out = body.clone();
    if definition.model_in_body
        && let Some(obj) = out.as_object_mut()
    {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(target_model.to_string()),
        );
    }
    out
}
