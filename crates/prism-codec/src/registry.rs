use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use bytes::Bytes;

use prism_common::{ApiFormat, DataFormat};
use prism_protocol::JsonValue;
use prism_protocol::sse::SseEvent;

use crate::error::ConvertError;
use crate::internal::{InternalError, InternalRequest, InternalResponse, StopReason, UsageInfo};
use crate::normalizers::{
    claude::ClaudeNormalizer, gemini::GeminiNormalizer, openai_chat::OpenAiChatNormalizer,
    openai_responses::OpenAiResponsesNormalizer,
};
use crate::stream_events::InternalStreamEvent;
use crate::stream_state::StreamState;

/// Per-data-format codec. All conversion is hub-and-spoke: source dialect
/// to the canonical form, canonical form to the target dialect.
pub trait Normalizer: Send + Sync {
    fn data_format(&self) -> DataFormat;

    fn request_to_internal(&self, body: &JsonValue) -> Result<InternalRequest, ConvertError>;
    fn request_from_internal(&self, req: &InternalRequest) -> Result<JsonValue, ConvertError>;

    fn response_to_internal(&self, body: &JsonValue) -> Result<InternalResponse, ConvertError>;
    fn response_from_internal(&self, resp: &InternalResponse) -> Result<JsonValue, ConvertError>;

    fn stream_event_to_internal(
        &self,
        event: &SseEvent,
        state: &mut StreamState,
    ) -> Result<Vec<InternalStreamEvent>, ConvertError>;

    fn stream_event_from_internal(
        &self,
        event: &InternalStreamEvent,
        state: &mut StreamState,
    ) -> Result<Vec<Bytes>, ConvertError>;

    /// Flush events held back for ordering once the upstream closes.
    fn stream_finish_to_internal(&self, _state: &mut StreamState) -> Vec<InternalStreamEvent> {
        Vec::new()
    }

    /// Trailing frames the target dialect requires (`data: [DONE]`).
    fn stream_finish_from_internal(&self, _state: &mut StreamState) -> Vec<Bytes> {
        Vec::new()
    }

    fn error_to_internal(&self, body: &JsonValue, status: Option<u16>) -> Option<InternalError>;
    fn error_from_internal(&self, error: &InternalError, request_id: Option<&str>) -> JsonValue;

    fn is_error_response(&self, body: &JsonValue) -> bool {
        self.error_to_internal(body, None).is_some()
    }
}

static CLAUDE: ClaudeNormalizer = ClaudeNormalizer;
static OPENAI_CHAT: OpenAiChatNormalizer = OpenAiChatNormalizer;
static OPENAI_RESPONSES: OpenAiResponsesNormalizer = OpenAiResponsesNormalizer;
static GEMINI: GeminiNormalizer = GeminiNormalizer;

/// Compile-time normalizer table; CLI formats alias onto their base data
/// format through `ApiFormat::data_format`.
pub fn normalizer(format: DataFormat) -> &'static dyn Normalizer {
    match format {
        DataFormat::Claude => &CLAUDE,
        DataFormat::OpenAiChat => &OPENAI_CHAT,
        DataFormat::OpenAiResponses => &OPENAI_RESPONSES,
        DataFormat::Gemini => &GEMINI,
    }
}

pub fn convert_request(
    client: ApiFormat,
    target: ApiFormat,
    body: &JsonValue,
) -> Result<JsonValue, ConvertError> {
    let src = normalizer(client.data_format());
    let dst = normalizer(target.data_format());
    let internal = src.request_to_internal(body)?;
    dst.request_from_internal(&internal)
}

pub fn convert_response(
    target: ApiFormat,
    client: ApiFormat,
    body: &JsonValue,
) -> Result<JsonValue, ConvertError> {
    let src = normalizer(target.data_format());
    let dst = normalizer(client.data_format());
    let internal = src.response_to_internal(body)?;
    dst.response_from_internal(&internal)
}

/// Re-emit an upstream error body in the client dialect. Falls back to a
/// status-derived error when the body is not a recognizable envelope.
pub fn convert_error_body(
    target: ApiFormat,
    client: ApiFormat,
    status: u16,
    body: &[u8],
    request_id: Option<&str>,
) -> JsonValue {
    let src = normalizer(target.data_format());
    let dst = normalizer(client.data_format());
    let parsed = serde_json::from_slice::<JsonValue>(body).ok();
    let error = parsed
        .as_ref()
        .and_then(|value| src.error_to_internal(value, Some(status)))
        .unwrap_or_else(|| {
            let message = String::from_utf8_lossy(body);
            let message = if message.trim().is_empty() {
                format!("upstream returned status {status}")
            } else {
                message.into_owned()
            };
            InternalError::from_status(status, message)
        });
    dst.error_from_internal(&error, request_id)
}

/// Inspect one decoded stream data payload for an embedded error envelope.
pub fn peek_embedded_error(format: ApiFormat, data: &str) -> Option<InternalError> {
    let body: JsonValue = serde_json::from_str(data).ok()?;
    let norm = normalizer(format.data_format());
    if norm.is_error_response(&body) {
        norm.error_to_internal(&body, None)
    } else {
        None
    }
}

pub fn stream_media_type(_client: ApiFormat) -> &'static str {
    "text/event-stream"
}

/// Streaming conversion driver for one attempt. In passthrough mode it only
/// scans events for usage and stop reason; in converting mode it also
/// produces target-dialect frames.
pub struct StreamConverter {
    src: &'static dyn Normalizer,
    dst: Option<&'static dyn Normalizer>,
    state: StreamState,
    usage: UsageInfo,
    stop_reason: Option<StopReason>,
    error: Option<InternalError>,
}

impl StreamConverter {
    pub fn passthrough(endpoint: ApiFormat) -> Self {
        Self {
            src: normalizer(endpoint.data_format()),
            dst: None,
            state: StreamState::new(),
            usage: UsageInfo::default(),
            stop_reason: None,
            error: None,
        }
    }

    pub fn converting(client: ApiFormat, endpoint: ApiFormat) -> Self {
        Self {
            src: normalizer(endpoint.data_format()),
            dst: Some(normalizer(client.data_format())),
            state: StreamState::new(),
            usage: UsageInfo::default(),
            stop_reason: None,
            error: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.dst.is_none()
    }

    pub fn push_event(&mut self, event: &SseEvent) -> Result<Vec<Bytes>, ConvertError> {
        let internal = self.src.stream_event_to_internal(event, &mut self.state)?;
        self.absorb(&internal);
        self.emit(internal)
    }

    pub fn finish(&mut self) -> Result<Vec<Bytes>, ConvertError> {
        let internal = self.src.stream_finish_to_internal(&mut self.state);
        self.absorb(&internal);
        let mut out = self.emit(internal)?;
        if let Some(dst) = self.dst {
            out.extend(dst.stream_finish_from_internal(&mut self.state));
        }
        Ok(out)
    }

    fn emit(&mut self, internal: Vec<InternalStreamEvent>) -> Result<Vec<Bytes>, ConvertError> {
        let Some(dst) = self.dst else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for event in &internal {
            out.extend(dst.stream_event_from_internal(event, &mut self.state)?);
        }
        Ok(out)
    }

    fn absorb(&mut self, events: &[InternalStreamEvent]) {
        for event in events {
            match event {
                InternalStreamEvent::MessageStart { usage, .. } => {
                    if let Some(usage) = usage {
                        self.usage.merge_max(usage);
                    }
                }
                InternalStreamEvent::Usage { usage } => self.usage.merge_max(usage),
                InternalStreamEvent::MessageStop { stop_reason, usage } => {
                    if let Some(usage) = usage {
                        self.usage.merge_max(usage);
                    }
                    if stop_reason.is_some() {
                        self.stop_reason = *stop_reason;
                    }
                }
                InternalStreamEvent::Error { error } => {
                    self.error = Some(error.clone());
                }
                _ => {}
            }
        }
    }

    pub fn usage(&self) -> UsageInfo {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn embedded_error(&self) -> Option<&InternalError> {
        self.error.as_ref()
    }
}

/// One warning per unknown wire structure per process.
pub(crate) fn warn_unknown(format: DataFormat, raw_type: &str) {
    static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let warned = WARNED.get_or_init(|| Mutex::new(HashSet::new()));
    let key = format!("{format:?}/{raw_type}");
    let mut guard = match warned.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.insert(key) {
        tracing::warn!(?format, raw_type, "dropping unknown structure at output");
    }
}
