pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

/// Hop-by-hop headers plus the client's framing headers, never forwarded
/// upstream or back to the client.
const STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|(k, _)| {
        let key = k.to_ascii_lowercase();
        !STRIPPED.contains(&key.as_str())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("X-Api-Key".into(), "a".into())];
        header_set(&mut headers, "x-api-key", "b");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "X-API-KEY"), Some("b"));
    }

    #[test]
    fn hop_by_hop_is_stripped() {
        let mut headers: Headers = vec![
            ("Host".into(), "example.com".into()),
            ("Content-Length".into(), "12".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
            ("x-api-key".into(), "sk-1".into()),
        ];
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers, vec![("x-api-key".to_string(), "sk-1".to_string())]);
    }
}
