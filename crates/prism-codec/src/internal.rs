use prism_protocol::{JsonObject, JsonValue};

/// Canonical message role shared by every dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
    Tool,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
    ContentFiltered,
    Unknown,
}

/// Canonical content block. Dialect structures the gateway does not model
/// survive as `Unknown` on the canonical side and are dropped at output.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: Option<String>,
        media_type: Option<String>,
        url: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        tool_use_id: String,
        output: Option<JsonValue>,
        content_text: Option<String>,
        is_error: bool,
    },
    Unknown {
        raw_type: String,
        payload: JsonValue,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// System/developer instruction segment; order is preserved so OpenAI
/// system/developer structure survives a round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSegment {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema for the tool input.
    pub parameters: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalRequest {
    pub model: String,
    pub instructions: Vec<InstructionSegment>,
    pub messages: Vec<InternalMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: bool,
    pub tools: Option<Vec<ToolSpec>>,
    pub tool_choice: Option<ToolChoice>,
    pub extra: JsonObject,
}

impl InternalRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions: Vec::new(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: false,
            tools: None,
            tool_choice: None,
            extra: JsonObject::new(),
        }
    }

    /// Joined instruction text for dialects that take a single system string.
    pub fn instruction_text(&self) -> Option<String> {
        if self.instructions.is_empty() {
            return None;
        }
        Some(
            self.instructions
                .iter()
                .map(|seg| seg.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl UsageInfo {
    /// Streams may report usage several times with growing counts; keep the
    /// field-wise maximum.
    pub fn merge_max(&mut self, other: &UsageInfo) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.total_tokens = self.total_tokens.max(other.total_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(other.cache_write_tokens);
    }

    pub fn is_empty(&self) -> bool {
        *self == UsageInfo::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
    pub usage: Option<UsageInfo>,
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimit,
    Overloaded,
    ServerError,
    ContentFiltered,
    ContextLengthExceeded,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
}

impl InternalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ErrorKind::RateLimit | ErrorKind::Overloaded | ErrorKind::ServerError
        );
        Self {
            kind,
            message: message.into(),
            code: None,
            retryable,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 413 | 422 => ErrorKind::InvalidRequest,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::PermissionDenied,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimit,
            500..=502 | 504 => ErrorKind::ServerError,
            503 | 529 => ErrorKind::Overloaded,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, message)
    }

    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::InvalidRequest
            | ErrorKind::ContentFiltered
            | ErrorKind::ContextLengthExceeded => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimit => 429,
            ErrorKind::Overloaded => 503,
            ErrorKind::ServerError | ErrorKind::Unknown => 500,
        }
    }
}
