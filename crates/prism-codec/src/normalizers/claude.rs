use bytes::Bytes;

use prism_common::DataFormat;
use prism_protocol::claude::error::{ErrorDetail, ErrorEnvelope};
use prism_protocol::claude::message::{
    self as wire, ContentBlock as WireBlock, CreateMessageRequest, KnownContentBlock, Message,
    MessageContent, MessageParam, MessageRole, SystemPrompt, Usage,
};
use prism_protocol::claude::stream::{
    ContentBlockDelta, KnownStreamEvent, MessageDelta, StreamEvent,
};
use prism_protocol::sse::{SseEvent, encode_sse};
use prism_protocol::{JsonObject, JsonValue};

use crate::error::ConvertError;
use crate::internal::{
    ContentBlock, ErrorKind, InstructionSegment, InternalError, InternalMessage, InternalRequest,
    InternalResponse, Role, StopReason, ToolChoice, ToolSpec, UsageInfo,
};
use crate::normalizers::raw_type_of;
use crate::registry::{Normalizer, warn_unknown};
use crate::stream_events::{BlockKind, InternalStreamEvent};
use crate::stream_state::StreamState;

pub struct ClaudeNormalizer;

const FORMAT: DataFormat = DataFormat::Claude;
const DEFAULT_MAX_TOKENS: u32 = 4096;

impl Normalizer for ClaudeNormalizer {
    fn data_format(&self) -> DataFormat {
        FORMAT
    }

    fn request_to_internal(&self, body: &JsonValue) -> Result<InternalRequest, ConvertError> {
        let req: CreateMessageRequest = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut internal = InternalRequest::new(req.model);
        if let Some(system) = req.system {
            let text = match system {
                SystemPrompt::Text(text) => text,
                SystemPrompt::Blocks(blocks) => blocks
                    .into_iter()
                    .map(|b| b.text)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            };
            internal.instructions.push(InstructionSegment {
                role: Role::System,
                text,
            });
        }
        for message in req.messages {
            internal.messages.push(message_to_internal(message));
        }
        internal.max_tokens = Some(req.max_tokens);
        internal.temperature = req.temperature;
        internal.top_p = req.top_p;
        internal.top_k = req.top_k;
        internal.stop_sequences = req.stop_sequences;
        internal.stream = req.stream.unwrap_or(false);
        internal.tools = req.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| ToolSpec {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                })
                .collect()
        });
        internal.tool_choice = req.tool_choice.map(|choice| match choice {
            wire::ToolChoice::Auto => ToolChoice::Auto,
            wire::ToolChoice::Any => ToolChoice::Required,
            wire::ToolChoice::None => ToolChoice::None,
            wire::ToolChoice::Tool { name } => ToolChoice::Tool { name },
        });
        internal.extra = req.extra;
        Ok(internal)
    }

    fn request_from_internal(&self, req: &InternalRequest) -> Result<JsonValue, ConvertError> {
        let mut messages = Vec::with_capacity(req.messages.len());
        for message in &req.messages {
            if let Some(param) = message_from_internal(message)? {
                messages.push(param);
            }
        }

        let out = CreateMessageRequest {
            model: req.model.clone(),
            messages,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: req.instruction_text().map(SystemPrompt::Text),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone(),
            stream: req.stream.then_some(true),
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| wire::ToolDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.parameters.clone(),
                        extra: JsonObject::new(),
                    })
                    .collect()
            }),
            tool_choice: req.tool_choice.as_ref().map(|choice| match choice {
                ToolChoice::Auto => wire::ToolChoice::Auto,
                ToolChoice::Required => wire::ToolChoice::Any,
                ToolChoice::None => wire::ToolChoice::None,
                ToolChoice::Tool { name } => wire::ToolChoice::Tool { name: name.clone() },
            }),
            metadata: None,
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(out)?)
    }

    fn response_to_internal(&self, body: &JsonValue) -> Result<InternalResponse, ConvertError> {
        let message: Message = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;
        Ok(InternalResponse {
            id: message.id,
            model: message.model,
            content: message.content.iter().map(block_to_internal).collect(),
            stop_reason: message.stop_reason.map(stop_to_internal),
            usage: Some(usage_to_internal(&message.usage)),
            extra: message.extra,
        })
    }

    fn response_from_internal(&self, resp: &InternalResponse) -> Result<JsonValue, ConvertError> {
        let mut content = Vec::new();
        for block in &resp.content {
            if let Some(out) = block_from_internal(block) {
                content.push(out);
            }
        }
        let message = Message {
            id: resp.id.clone(),
            r#type: "message".to_string(),
            role: MessageRole::Assistant,
            model: resp.model.clone(),
            content,
            stop_reason: resp.stop_reason.and_then(stop_from_internal),
            stop_sequence: None,
            usage: resp.usage.map(usage_from_internal).unwrap_or_default(),
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(message)?)
    }

    fn stream_event_to_internal(
        &self,
        event: &SseEvent,
        state: &mut StreamState,
    ) -> Result<Vec<InternalStreamEvent>, ConvertError> {
        let data = event.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }
        let parsed: StreamEvent = serde_json::from_str(data)
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let known = match parsed {
            StreamEvent::Known(known) => known,
            StreamEvent::Unknown(value) => {
                let raw_type = raw_type_of(&value);
                return Ok(vec![InternalStreamEvent::Unknown {
                    raw_type,
                    payload: value,
                }]);
            }
        };

        let events = match known {
            KnownStreamEvent::MessageStart { message } => {
                state.message_id = message.id.clone();
                state.model = message.model.clone();
                let usage = usage_to_internal(&message.usage);
                state.claude.usage_acc.merge_max(&usage);
                vec![InternalStreamEvent::MessageStart {
                    message_id: message.id,
                    model: message.model,
                    usage: Some(usage),
                }]
            }
            KnownStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlock::Known(KnownContentBlock::Text { .. }) => {
                    vec![InternalStreamEvent::ContentBlockStart {
                        index,
                        kind: BlockKind::Text,
                        tool_id: None,
                        tool_name: None,
                    }]
                }
                WireBlock::Known(KnownContentBlock::ToolUse { id, name, .. }) => {
                    state.claude.tool_ids.insert(index, id.clone());
                    vec![InternalStreamEvent::ContentBlockStart {
                        index,
                        kind: BlockKind::ToolUse,
                        tool_id: Some(id),
                        tool_name: Some(name),
                    }]
                }
                WireBlock::Known(other) => {
                    let payload = serde_json::to_value(&other)?;
                    vec![InternalStreamEvent::Unknown {
                        raw_type: raw_type_of(&payload),
                        payload,
                    }]
                }
                WireBlock::Unknown(value) => vec![InternalStreamEvent::Unknown {
                    raw_type: raw_type_of(&value),
                    payload: value,
                }],
            },
            KnownStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => {
                    vec![InternalStreamEvent::ContentDelta { index, text }]
                }
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    let tool_id = state
                        .claude
                        .tool_ids
                        .get(&index)
                        .cloned()
                        .unwrap_or_default();
                    vec![InternalStreamEvent::ToolCallDelta {
                        index,
                        tool_id,
                        input_delta: partial_json,
                    }]
                }
                ContentBlockDelta::ThinkingDelta { .. }
                | ContentBlockDelta::SignatureDelta { .. } => {
                    let payload = serde_json::to_value(&delta)?;
                    vec![InternalStreamEvent::Unknown {
                        raw_type: raw_type_of(&payload),
                        payload,
                    }]
                }
            },
            KnownStreamEvent::ContentBlockStop { index } => {
                vec![InternalStreamEvent::ContentBlockStop { index }]
            }
            KnownStreamEvent::MessageDelta { delta, usage } => {
                let usage = usage_to_internal(&usage);
                state.claude.usage_acc.merge_max(&usage);
                if let Some(stop) = delta.stop_reason {
                    state.claude.pending_stop = Some(stop_to_internal(stop));
                }
                vec![InternalStreamEvent::Usage { usage }]
            }
            KnownStreamEvent::MessageStop => {
                vec![InternalStreamEvent::MessageStop {
                    stop_reason: state.claude.pending_stop.take(),
                    usage: Some(state.claude.usage_acc),
                }]
            }
            KnownStreamEvent::Ping => Vec::new(),
            KnownStreamEvent::Error { error } => {
                vec![InternalStreamEvent::Error {
                    error: error_detail_to_internal(&error),
                }]
            }
        };
        Ok(events)
    }

    fn stream_event_from_internal(
        &self,
        event: &InternalStreamEvent,
        state: &mut StreamState,
    ) -> Result<Vec<Bytes>, ConvertError> {
        let mut out = Vec::new();
        match event {
            InternalStreamEvent::MessageStart {
                message_id,
                model,
                usage,
            } => {
                if !state.claude.started {
                    state.claude.started = true;
                    if let Some(usage) = usage {
                        state.claude.final_usage.merge_max(usage);
                    }
                    out.push(encode_event(&KnownStreamEvent::MessageStart {
                        message: start_message(message_id, model, usage.as_ref()),
                    })?);
                }
            }
            InternalStreamEvent::ContentBlockStart {
                index,
                kind,
                tool_id,
                tool_name,
            } => {
                self.ensure_started(state, &mut out)?;
                let block = match kind {
                    BlockKind::Text => WireBlock::Known(KnownContentBlock::Text {
                        text: String::new(),
                    }),
                    BlockKind::ToolUse => WireBlock::Known(KnownContentBlock::ToolUse {
                        id: tool_id.clone().unwrap_or_default(),
                        name: tool_name.clone().unwrap_or_default(),
                        input: JsonValue::Object(serde_json::Map::new()),
                    }),
                };
                state.claude.open_blocks.insert(*index, *kind);
                out.push(encode_event(&KnownStreamEvent::ContentBlockStart {
                    index: *index,
                    content_block: block,
                })?);
            }
            InternalStreamEvent::ContentDelta { index, text } => {
                self.ensure_started(state, &mut out)?;
                self.ensure_block(state, *index, BlockKind::Text, &mut out)?;
                out.push(encode_event(&KnownStreamEvent::ContentBlockDelta {
                    index: *index,
                    delta: ContentBlockDelta::TextDelta { text: text.clone() },
                })?);
            }
            InternalStreamEvent::ToolCallDelta {
                index, input_delta, ..
            } => {
                self.ensure_started(state, &mut out)?;
                self.ensure_block(state, *index, BlockKind::ToolUse, &mut out)?;
                out.push(encode_event(&KnownStreamEvent::ContentBlockDelta {
                    index: *index,
                    delta: ContentBlockDelta::InputJsonDelta {
                        partial_json: input_delta.clone(),
                    },
                })?);
            }
            InternalStreamEvent::ContentBlockStop { index } => {
                if state.claude.open_blocks.remove(index).is_some() {
                    out.push(encode_event(&KnownStreamEvent::ContentBlockStop {
                        index: *index,
                    })?);
                }
            }
            InternalStreamEvent::Usage { usage } => {
                state.claude.final_usage.merge_max(usage);
            }
            InternalStreamEvent::MessageStop { stop_reason, usage } => {
                if state.claude.finished {
                    return Ok(out);
                }
                self.ensure_started(state, &mut out)?;
                state.claude.finished = true;
                let mut open: Vec<u32> = state.claude.open_blocks.keys().copied().collect();
                open.sort_unstable();
                for index in open {
                    state.claude.open_blocks.remove(&index);
                    out.push(encode_event(&KnownStreamEvent::ContentBlockStop { index })?);
                }
                if let Some(usage) = usage {
                    state.claude.final_usage.merge_max(usage);
                }
                out.push(encode_event(&KnownStreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: stop_reason.and_then(stop_from_internal),
                        stop_sequence: None,
                    },
                    usage: usage_from_internal(state.claude.final_usage),
                })?);
                out.push(encode_event(&KnownStreamEvent::MessageStop)?);
            }
            InternalStreamEvent::Error { error } => {
                out.push(encode_event(&KnownStreamEvent::Error {
                    error: error_detail_from_internal(error),
                })?);
            }
            InternalStreamEvent::Unknown { raw_type, .. } => {
                warn_unknown(FORMAT, raw_type);
            }
        }
        Ok(out)
    }

    fn error_to_internal(&self, body: &JsonValue, status: Option<u16>) -> Option<InternalError> {
        let envelope: ErrorEnvelope = serde_json::from_value(body.clone()).ok()?;
        if envelope.r#type != "error" {
            return None;
        }
        let mut error = error_detail_to_internal(&envelope.error);
        if error.kind == ErrorKind::Unknown
            && let Some(status) = status
        {
            error = InternalError::from_status(status, error.message);
        }
        Some(error)
    }

    fn error_from_internal(&self, error: &InternalError, request_id: Option<&str>) -> JsonValue {
        let mut envelope = ErrorEnvelope::new(error_type_name(error.kind), error.message.clone());
        envelope.request_id = request_id.map(|id| id.to_string());
        serde_json::to_value(envelope).unwrap_or(JsonValue::Null)
    }
}

impl ClaudeNormalizer {
    fn ensure_started(
        &self,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
    ) -> Result<(), ConvertError> {
        if state.claude.started {
            return Ok(());
        }
        state.claude.started = true;
        if state.message_id.is_empty() {
            state.message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        }
        let id = state.message_id.clone();
        let model = state.model.clone();
        out.push(encode_event(&KnownStreamEvent::MessageStart {
            message: start_message(&id, &model, None),
        })?);
        Ok(())
    }

    fn ensure_block(
        &self,
        state: &mut StreamState,
        index: u32,
        kind: BlockKind,
        out: &mut Vec<Bytes>,
    ) -> Result<(), ConvertError> {
        if state.claude.open_blocks.contains_key(&index) {
            return Ok(());
        }
        state.claude.open_blocks.insert(index, kind);
        let block = match kind {
            BlockKind::Text => WireBlock::Known(KnownContentBlock::Text {
                text: String::new(),
            }),
            BlockKind::ToolUse => WireBlock::Known(KnownContentBlock::ToolUse {
                id: String::new(),
                name: String::new(),
                input: JsonValue::Object(serde_json::Map::new()),
            }),
        };
        out.push(encode_event(&KnownStreamEvent::ContentBlockStart {
            index,
            content_block: block,
        })?);
        Ok(())
    }
}

fn message_to_internal(message: MessageParam) -> InternalMessage {
    let role = match message.role {
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };
    let content = match message.content {
        MessageContent::Text(text) => vec![ContentBlock::Text { text }],
        MessageContent::Blocks(blocks) => blocks.iter().map(block_to_internal).collect(),
    };
    InternalMessage { role, content }
}

fn message_from_internal(message: &InternalMessage) -> Result<Option<MessageParam>, ConvertError> {
    let role = match message.role {
        Role::Assistant => MessageRole::Assistant,
        // Tool results travel as user-content tool_result blocks.
        _ => MessageRole::User,
    };
    let mut blocks = Vec::new();
    for block in &message.content {
        if let Some(out) = block_from_internal(block) {
            blocks.push(out);
        }
    }
    if blocks.is_empty() {
        return Ok(None);
    }
    Ok(Some(MessageParam {
        role,
        content: MessageContent::Blocks(blocks),
    }))
}

fn block_to_internal(block: &WireBlock) -> ContentBlock {
    match block {
        WireBlock::Known(KnownContentBlock::Text { text }) => {
            ContentBlock::Text { text: text.clone() }
        }
        WireBlock::Known(KnownContentBlock::Image { source }) => match source {
            wire::ImageSource::Base64 { media_type, data } => ContentBlock::Image {
                data: Some(data.clone()),
                media_type: Some(media_type.clone()),
                url: None,
            },
            wire::ImageSource::Url { url } => ContentBlock::Image {
                data: None,
                media_type: None,
                url: Some(url.clone()),
            },
        },
        WireBlock::Known(KnownContentBlock::ToolUse { id, name, input }) => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        WireBlock::Known(KnownContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        }) => {
            let (output, content_text) = match content {
                Some(JsonValue::String(text)) => (None, Some(text.clone())),
                Some(value) => (Some(value.clone()), tool_result_text(value)),
                None => (None, None),
            };
            ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                output,
                content_text,
                is_error: is_error.unwrap_or(false),
            }
        }
        WireBlock::Unknown(value) => ContentBlock::Unknown {
            raw_type: raw_type_of(value),
            payload: value.clone(),
        },
    }
}

fn block_from_internal(block: &ContentBlock) -> Option<WireBlock> {
    match block {
        ContentBlock::Text { text } => {
            Some(WireBlock::Known(KnownContentBlock::Text { text: text.clone() }))
        }
        ContentBlock::Image {
            data,
            media_type,
            url,
        } => {
            let source = if let (Some(data), Some(media_type)) = (data, media_type) {
                wire::ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                }
            } else if let Some(url) = url {
                wire::ImageSource::Url { url: url.clone() }
            } else {
                return None;
            };
            Some(WireBlock::Known(KnownContentBlock::Image { source }))
        }
        ContentBlock::ToolUse { id, name, input } => {
            Some(WireBlock::Known(KnownContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            content_text,
            is_error,
        } => {
            let content = match (content_text, output) {
                (Some(text), _) => Some(JsonValue::String(text.clone())),
                (None, Some(value)) => Some(value.clone()),
                (None, None) => None,
            };
            Some(WireBlock::Known(KnownContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content,
                is_error: is_error.then_some(true),
            }))
        }
        ContentBlock::Unknown { raw_type, .. } => {
            warn_unknown(FORMAT, raw_type);
            None
        }
    }
}

/// Best-effort text view of a structured tool result (array of text blocks).
fn tool_result_text(value: &JsonValue) -> Option<String> {
    let items = value.as_array()?;
    let texts: Vec<&str> = items
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn stop_to_internal(stop: wire::StopReason) -> StopReason {
    match stop {
        wire::StopReason::EndTurn => StopReason::EndTurn,
        wire::StopReason::MaxTokens => StopReason::MaxTokens,
        wire::StopReason::StopSequence => StopReason::StopSequence,
        wire::StopReason::ToolUse => StopReason::ToolUse,
        wire::StopReason::PauseTurn => StopReason::PauseTurn,
        wire::StopReason::Refusal => StopReason::Refusal,
    }
}

fn stop_from_internal(stop: StopReason) -> Option<wire::StopReason> {
    match stop {
        StopReason::EndTurn => Some(wire::StopReason::EndTurn),
        StopReason::MaxTokens => Some(wire::StopReason::MaxTokens),
        StopReason::StopSequence => Some(wire::StopReason::StopSequence),
        StopReason::ToolUse => Some(wire::StopReason::ToolUse),
        StopReason::PauseTurn => Some(wire::StopReason::PauseTurn),
        StopReason::Refusal => Some(wire::StopReason::Refusal),
        StopReason::ContentFiltered => Some(wire::StopReason::Refusal),
        StopReason::Unknown => Some(wire::StopReason::EndTurn),
    }
}

fn usage_to_internal(usage: &Usage) -> UsageInfo {
    let input = usage.input_tokens.unwrap_or(0);
    let output = usage.output_tokens.unwrap_or(0);
    UsageInfo {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        cache_write_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
    }
}

fn usage_from_internal(usage: UsageInfo) -> Usage {
    Usage {
        input_tokens: Some(usage.input_tokens),
        output_tokens: Some(usage.output_tokens),
        cache_creation_input_tokens: Some(usage.cache_write_tokens),
        cache_read_input_tokens: Some(usage.cache_read_tokens),
        extra: JsonObject::new(),
    }
}

fn start_message(id: &str, model: &str, usage: Option<&UsageInfo>) -> Message {
    Message {
        id: id.to_string(),
        r#type: "message".to_string(),
        role: MessageRole::Assistant,
        model: model.to_string(),
        content: Vec::new(),
        stop_reason: None,
        stop_sequence: None,
        usage: usage.copied().map(usage_from_internal).unwrap_or_default(),
        extra: JsonObject::new(),
    }
}

fn encode_event(event: &KnownStreamEvent) -> Result<Bytes, ConvertError> {
    let value = serde_json::to_value(event)?;
    let name = value.get("type").and_then(|v| v.as_str()).map(String::from);
    let data = serde_json::to_string(&value)?;
    Ok(encode_sse(name.as_deref(), &data))
}

fn error_detail_to_internal(detail: &ErrorDetail) -> InternalError {
    let kind = match detail.r#type.as_str() {
        "invalid_request_error" => ErrorKind::InvalidRequest,
        "authentication_error" => ErrorKind::Authentication,
        "permission_error" => ErrorKind::PermissionDenied,
        "not_found_error" => ErrorKind::NotFound,
        "rate_limit_error" => ErrorKind::RateLimit,
        "overloaded_error" => ErrorKind::Overloaded,
        "api_error" => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    };
    let mut error = InternalError::new(kind, detail.message.clone());
    error.code = Some(detail.r#type.clone());
    error
}

fn error_detail_from_internal(error: &InternalError) -> ErrorDetail {
    ErrorDetail {
        r#type: error_type_name(error.kind).to_string(),
        message: error.message.clone(),
    }
}

fn error_type_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest
        | ErrorKind::ContextLengthExceeded
        | ErrorKind::ContentFiltered => "invalid_request_error",
        ErrorKind::Authentication => "authentication_error",
        ErrorKind::PermissionDenied => "permission_error",
        ErrorKind::NotFound => "not_found_error",
        ErrorKind::RateLimit => "rate_limit_error",
        ErrorKind::Overloaded => "overloaded_error",
        ErrorKind::ServerError | ErrorKind::Unknown => "api_error",
    }
}
