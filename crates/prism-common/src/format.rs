use serde::{Deserialize, Serialize};

/// Client- and endpoint-facing wire dialect.
///
/// `*Cli` variants share the payload structure of their base dialect and
/// differ only in authentication, except `OpenAiCli`, which speaks the
/// Responses API and is a distinct data format from Chat Completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    #[serde(rename = "CLAUDE")]
    Claude,
    #[serde(rename = "CLAUDE_CLI")]
    ClaudeCli,
    #[serde(rename = "OPENAI")]
    OpenAi,
    #[serde(rename = "OPENAI_CLI")]
    OpenAiCli,
    #[serde(rename = "GEMINI")]
    Gemini,
    #[serde(rename = "GEMINI_CLI")]
    GeminiCli,
}

/// Payload structure identifier. Formats sharing a `DataFormat` can be
/// proxied byte-for-byte without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Claude,
    OpenAiChat,
    OpenAiResponses,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// Credential goes into a dedicated header verbatim.
    Header,
    /// Credential goes into `Authorization: Bearer <secret>`.
    Bearer,
}

#[derive(Debug, Clone, Copy)]
pub struct FormatDefinition {
    pub api_format: ApiFormat,
    pub aliases: &'static [&'static str],
    /// Default upstream request path; `Endpoint.custom_path` overrides.
    pub default_path: &'static str,
    pub auth_header: &'static str,
    pub auth_style: AuthStyle,
    /// Headers the dialect requires on every upstream request.
    pub extra_headers: &'static [(&'static str, &'static str)],
    /// Lowercase header names endpoint header rules must not override.
    pub protected_keys: &'static [&'static str],
    /// Gemini carries the model in the URL, not the body.
    pub model_in_body: bool,
    /// Gemini selects streaming by URL action, not a body flag.
    pub stream_in_body: bool,
    pub data_format: DataFormat,
}

static DEFINITIONS: [FormatDefinition; 6] = [
    FormatDefinition {
        api_format: ApiFormat::Claude,
        aliases: &["claude", "anthropic", "claude_compatible"],
        default_path: "/v1/messages",
        auth_header: "x-api-key",
        auth_style: AuthStyle::Header,
        extra_headers: &[("anthropic-version", "2023-06-01")],
        protected_keys: &["x-api-key", "content-type", "anthropic-version"],
        model_in_body: true,
        stream_in_body: true,
        data_format: DataFormat::Claude,
    },
    FormatDefinition {
        api_format: ApiFormat::ClaudeCli,
        aliases: &["claude_cli", "claude-cli"],
        default_path: "/v1/messages",
        auth_header: "authorization",
        auth_style: AuthStyle::Bearer,
        extra_headers: &[("anthropic-version", "2023-06-01")],
        protected_keys: &["authorization", "content-type"],
        model_in_body: true,
        stream_in_body: true,
        data_format: DataFormat::Claude,
    },
    FormatDefinition {
        api_format: ApiFormat::OpenAi,
        aliases: &["openai", "deepseek", "grok", "moonshot", "qwen", "openai_compatible"],
        default_path: "/v1/chat/completions",
        auth_header: "authorization",
        auth_style: AuthStyle::Bearer,
        extra_headers: &[],
        protected_keys: &["authorization", "content-type"],
        model_in_body: true,
        stream_in_body: true,
        data_format: DataFormat::OpenAiChat,
    },
    FormatDefinition {
        api_format: ApiFormat::OpenAiCli,
        aliases: &["openai_cli", "responses"],
        default_path: "/v1/responses",
        auth_header: "authorization",
        auth_style: AuthStyle::Bearer,
        extra_headers: &[],
        protected_keys: &["authorization", "content-type"],
        model_in_body: true,
        stream_in_body: true,
        data_format: DataFormat::OpenAiResponses,
    },
    FormatDefinition {
        api_format: ApiFormat::Gemini,
        aliases: &["gemini", "google", "vertex"],
        default_path: "/v1beta/models/{model}:{action}",
        auth_header: "x-goog-api-key",
        auth_style: AuthStyle::Header,
        extra_headers: &[],
        protected_keys: &["x-goog-api-key", "content-type"],
        model_in_body: false,
        stream_in_body: false,
        data_format: DataFormat::Gemini,
    },
    FormatDefinition {
        api_format: ApiFormat::GeminiCli,
        aliases: &["gemini_cli", "gemini-cli"],
        default_path: "/v1beta/models/{model}:{action}",
        auth_header: "x-goog-api-key",
        auth_style: AuthStyle::Header,
        extra_headers: &[],
        protected_keys: &["x-goog-api-key", "content-type"],
        model_in_body: false,
        stream_in_body: false,
        data_format: DataFormat::Gemini,
    },
];

impl ApiFormat {
    /// Enum order doubles as the endpoint preferred-format order when
    /// ordering candidates.
    pub const ALL: [ApiFormat; 6] = [
        ApiFormat::Claude,
        ApiFormat::ClaudeCli,
        ApiFormat::OpenAi,
        ApiFormat::OpenAiCli,
        ApiFormat::Gemini,
        ApiFormat::GeminiCli,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApiFormat::Claude => "CLAUDE",
            ApiFormat::ClaudeCli => "CLAUDE_CLI",
            ApiFormat::OpenAi => "OPENAI",
            ApiFormat::OpenAiCli => "OPENAI_CLI",
            ApiFormat::Gemini => "GEMINI",
            ApiFormat::GeminiCli => "GEMINI_CLI",
        }
    }

    pub fn order_index(self) -> usize {
        Self::ALL.iter().position(|f| *f == self).unwrap_or(usize::MAX)
    }

    pub fn is_cli(self) -> bool {
        matches!(
            self,
            ApiFormat::ClaudeCli | ApiFormat::OpenAiCli | ApiFormat::GeminiCli
        )
    }

    pub fn data_format(self) -> DataFormat {
        format_definition(self).data_format
    }
}

pub fn format_definition(format: ApiFormat) -> &'static FormatDefinition {
    // Table order mirrors the enum declaration.
    let index = match format {
        ApiFormat::Claude => 0,
        ApiFormat::ClaudeCli => 1,
        ApiFormat::OpenAi => 2,
        ApiFormat::OpenAiCli => 3,
        ApiFormat::Gemini => 4,
        ApiFormat::GeminiCli => 5,
    };
    &DEFINITIONS[index]
}

/// True iff the two formats share a payload structure and bytes can be
/// proxied without conversion.
pub fn is_passthrough(client: ApiFormat, endpoint: ApiFormat) -> bool {
    client == endpoint || client.data_format() == endpoint.data_format()
}

/// Resolve an enum name or alias to an `ApiFormat`. Matching is
/// case-insensitive and treats any run of non-alphanumerics as `_`.
pub fn resolve_api_format(value: &str) -> Option<ApiFormat> {
    let normalized = normalize_alias(value);
    if normalized.is_empty() {
        return None;
    }
    for def in &DEFINITIONS {
        if normalize_alias(def.api_format.as_str()) == normalized {
            return Some(def.api_format);
        }
        if def.aliases.iter().any(|a| normalize_alias(a) == normalized) {
            return Some(def.api_format);
        }
    }
    None
}

fn normalize_alias(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_sep = true;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_follows_data_format() {
        assert!(is_passthrough(ApiFormat::Claude, ApiFormat::ClaudeCli));
        assert!(is_passthrough(ApiFormat::Gemini, ApiFormat::GeminiCli));
        assert!(is_passthrough(ApiFormat::OpenAi, ApiFormat::OpenAi));
        // Responses API is a different payload structure from Chat Completions.
        assert!(!is_passthrough(ApiFormat::OpenAi, ApiFormat::OpenAiCli));
        assert!(!is_passthrough(ApiFormat::Claude, ApiFormat::OpenAi));
    }

    #[test]
    fn alias_resolution() {
        assert_eq!(resolve_api_format("claude"), Some(ApiFormat::Claude));
        assert_eq!(resolve_api_format("Anthropic"), Some(ApiFormat::Claude));
        assert_eq!(resolve_api_format("CLAUDE-CLI"), Some(ApiFormat::ClaudeCli));
        assert_eq!(resolve_api_format("responses"), Some(ApiFormat::OpenAiCli));
        assert_eq!(resolve_api_format("google"), Some(ApiFormat::Gemini));
        assert_eq!(resolve_api_format("unknown-vendor"), None);
    }

    #[test]
    fn gemini_carries_model_in_url() {
        let def = format_definition(ApiFormat::Gemini);
        assert!(!def.model_in_body);
        assert!(!def.stream_in_body);
        assert_eq!(def.auth_header, "x-goog-api-key");
    }

    #[test]
    fn claude_requires_version_header() {
        let def = format_definition(ApiFormat::Claude);
        assert_eq!(def.extra_headers, &[("anthropic-version", "2023-06-01")]);
        assert!(def.protected_keys.contains(&"anthropic-version"));
    }
}
