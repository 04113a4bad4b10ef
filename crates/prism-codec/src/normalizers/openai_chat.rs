use bytes::Bytes;

use prism_common::DataFormat;
use prism_protocol::openai::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatUsage,
    Choice, ChunkChoice, ChunkDelta, ContentPart, FunctionCall, FunctionDefinition, ImageUrl,
    KnownContentPart, MessageContent, PromptTokensDetails, ResponseMessage, StopSequences,
    StreamOptions, ToolCall, ToolCallDelta, ToolCallDeltaFunction, ToolDefinition,
};
use prism_protocol::openai::error::ErrorEnvelope;
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

pub struct OpenAiChatNormalizer;

const FORMAT: DataFormat = DataFormat::OpenAiChat;

impl Normalizer for OpenAiChatNormalizer {
    fn data_format(&self) -> DataFormat {
        FORMAT
    }

    fn request_to_internal(&self, body: &JsonValue) -> Result<InternalRequest, ConvertError> {
        let req: ChatCompletionRequest = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut internal = InternalRequest::new(req.model);
        for message in req.messages {
            match message.role.as_str() {
                "system" | "developer" => {
                    let role = if message.role == "developer" {
                        Role::Developer
                    } else {
                        Role::System
                    };
                    internal.instructions.push(InstructionSegment {
                        role,
                        text: content_text(message.content.as_ref()),
                    });
                }
                "tool" => {
                    internal.messages.push(InternalMessage {
                        role: Role::Tool,
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id: message.tool_call_id.unwrap_or_default(),
                            output: None,
                            content_text: Some(content_text(message.content.as_ref())),
                            is_error: false,
                        }],
                    });
                }
                "assistant" => {
                    let mut content = content_blocks(message.content.as_ref());
                    for call in message.tool_calls.unwrap_or_default() {
                        content.push(ContentBlock::ToolUse {
                            id: call.id,
                            name: call.function.name,
                            input: parse_arguments(&call.function.arguments),
                        });
                    }
                    internal.messages.push(InternalMessage {
                        role: Role::Assistant,
                        content,
                    });
                }
                _ => {
                    internal.messages.push(InternalMessage {
                        role: Role::User,
                        content: content_blocks(message.content.as_ref()),
                    });
                }
            }
        }

        internal.max_tokens = req.max_completion_tokens.or(req.max_tokens);
        internal.temperature = req.temperature;
        internal.top_p = req.top_p;
        internal.stop_sequences = req.stop.map(|stop| match stop {
            StopSequences::Single(s) => vec![s],
            StopSequences::Many(many) => many,
        });
        internal.stream = req.stream.unwrap_or(false);
        internal.tools = req.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| ToolSpec {
                    name: tool.function.name,
                    description: tool.function.description,
                    parameters: tool.function.parameters,
                })
                .collect()
        });
        internal.tool_choice = req.tool_choice.as_ref().and_then(tool_choice_to_internal);
        internal.extra = req.extra;
        Ok(internal)
    }

    fn request_from_internal(&self, req: &InternalRequest) -> Result<JsonValue, ConvertError> {
        let mut messages = Vec::new();
        for segment in &req.instructions {
            let role = match segment.role {
                Role::Developer => "developer",
                _ => "system",
            };
            messages.push(plain_message(role, &segment.text));
        }
        for message in &req.messages {
            messages.extend(message_from_internal(message)?);
        }

        let out = ChatCompletionRequest {
            model: req.model.clone(),
            messages,
            max_tokens: req.max_tokens,
            max_completion_tokens: None,
            temperature: req.temperature,
            top_p: req.top_p,
            stop: req.stop_sequences.clone().map(StopSequences::Many),
            stream: req.stream.then_some(true),
            // Without include_usage the final usage chunk never arrives and
            // metering would fall back to zero.
            stream_options: req.stream.then_some(StreamOptions {
                include_usage: Some(true),
            }),
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| ToolDefinition {
                        r#type: "function".to_string(),
                        function: FunctionDefinition {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_from_internal),
            user: None,
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(out)?)
    }

    fn response_to_internal(&self, body: &JsonValue) -> Result<InternalResponse, ConvertError> {
        let resp: ChatCompletionResponse = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut content = Vec::new();
        let mut stop_reason = None;
        if let Some(choice) = resp.choices.first() {
            if let Some(text) = &choice.message.content
                && !text.is_empty()
            {
                content.push(ContentBlock::Text { text: text.clone() });
            }
            for call in choice.message.tool_calls.clone().unwrap_or_default() {
                content.push(ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: parse_arguments(&call.function.arguments),
                });
            }
            stop_reason = choice.finish_reason.as_deref().map(finish_to_internal);
        }

        Ok(InternalResponse {
            id: resp.id,
            model: resp.model,
            content,
            stop_reason,
            usage: resp.usage.as_ref().map(usage_to_internal),
            extra: resp.extra,
        })
    }

    fn response_from_internal(&self, resp: &InternalResponse) -> Result<JsonValue, ConvertError> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &resp.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)?,
                    },
                }),
                ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {
                    return Err(ConvertError::unsupported(
                        FORMAT,
                        FORMAT,
                        "non-text content in a chat completion response",
                    ));
                }
                ContentBlock::Unknown { raw_type, .. } => warn_unknown(FORMAT, raw_type),
            }
        }

        let message = ResponseMessage {
            role: "assistant".to_string(),
            content: if text.is_empty() && !tool_calls.is_empty() {
                None
            } else {
                Some(text)
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            refusal: None,
            extra: JsonObject::new(),
        };

        let out = ChatCompletionResponse {
            id: ensure_chat_id(&resp.id),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: resp.model.clone(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(finish_from_internal(resp.stop_reason).to_string()),
                extra: JsonObject::new(),
            }],
            usage: resp.usage.map(usage_from_internal),
            system_fingerprint: None,
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(out)?)
    }

    fn stream_event_to_internal(
        &self,
        event: &SseEvent,
        state: &mut StreamState,
    ) -> Result<Vec<InternalStreamEvent>, ConvertError> {
        let data = event.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(flush_incoming_stop(state));
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(data)
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut events = Vec::new();
        let sub = &mut state.openai_chat;
        if !sub.started {
            sub.started = true;
            state.message_id = chunk.id.clone();
            state.model = chunk.model.clone();
            events.push(InternalStreamEvent::MessageStart {
                message_id: chunk.id.clone(),
                model: chunk.model.clone(),
                usage: None,
            });
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                let index = match sub.text_block_index {
                    Some(index) => index,
                    None => {
                        let index = sub.next_block_index;
                        sub.next_block_index += 1;
                        sub.text_block_index = Some(index);
                        events.push(InternalStreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::Text,
                            tool_id: None,
                            tool_name: None,
                        });
                        index
                    }
                };
                events.push(InternalStreamEvent::ContentDelta {
                    index,
                    text: text.clone(),
                });
            }

            for call in choice.delta.tool_calls.clone().unwrap_or_default() {
                let known = sub.tool_blocks.get(&call.index).cloned();
                let (index, tool_id) = match known {
                    Some(entry) => entry,
                    None => {
                        // A new tool call closes the text block, if any.
                        if let Some(text_index) = sub.text_block_index.take() {
                            events.push(InternalStreamEvent::ContentBlockStop {
                                index: text_index,
                            });
                        }
                        let index = sub.next_block_index;
                        sub.next_block_index += 1;
                        let tool_id = call.id.clone().unwrap_or_default();
                        let name = call
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        sub.tool_blocks
                            .insert(call.index, (index, tool_id.clone()));
                        events.push(InternalStreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::ToolUse,
                            tool_id: Some(tool_id.clone()),
                            tool_name: Some(name),
                        });
                        (index, tool_id)
                    }
                };
                if let Some(arguments) = call.function.and_then(|f| f.arguments)
                    && !arguments.is_empty()
                {
                    events.push(InternalStreamEvent::ToolCallDelta {
                        index,
                        tool_id,
                        input_delta: arguments,
                    });
                }
            }

            if let Some(finish) = &choice.finish_reason {
                sub.pending_stop = Some(finish_to_internal(finish));
            }
        }

        if let Some(usage) = &chunk.usage {
            let usage = usage_to_internal(usage);
            if state.openai_chat.pending_stop.is_some() {
                state.openai_chat.pending_usage = Some(usage);
            } else {
                events.push(InternalStreamEvent::Usage { usage });
            }
        }

        Ok(events)
    }

    fn stream_finish_to_internal(&self, state: &mut StreamState) -> Vec<InternalStreamEvent> {
        flush_incoming_stop(state)
    }

    fn stream_event_from_internal(
        &self,
        event: &InternalStreamEvent,
        state: &mut StreamState,
    ) -> Result<Vec<Bytes>, ConvertError> {
        let mut out = Vec::new();
        match event {
            InternalStreamEvent::MessageStart { model, .. } => {
                let sub = &mut state.openai_chat;
                if !sub.out_started {
                    sub.out_started = true;
                    sub.out_id = ensure_chat_id("");
                    sub.out_created = now_unix();
                    if state.model.is_empty() {
                        state.model = model.clone();
                    }
                    let mut delta = ChunkDelta::default();
                    delta.role = Some("assistant".to_string());
                    delta.content = Some(String::new());
                    out.push(encode_chunk(state, delta, None)?);
                }
            }
            InternalStreamEvent::ContentBlockStart {
                index,
                kind,
                tool_id,
                tool_name,
            } => {
                if *kind == BlockKind::ToolUse {
                    let openai_index = state.openai_chat.out_tool_indexes.len() as u32;
                    state.openai_chat.out_tool_indexes.insert(*index, openai_index);
                    let mut delta = ChunkDelta::default();
                    delta.tool_calls = Some(vec![ToolCallDelta {
                        index: openai_index,
                        id: tool_id.clone(),
                        r#type: Some("function".to_string()),
                        function: Some(ToolCallDeltaFunction {
                            name: tool_name.clone(),
                            arguments: Some(String::new()),
                        }),
                    }]);
                    out.push(encode_chunk(state, delta, None)?);
                }
            }
            InternalStreamEvent::ContentDelta { text, .. } => {
                let mut delta = ChunkDelta::default();
                delta.content = Some(text.clone());
                out.push(encode_chunk(state, delta, None)?);
            }
            InternalStreamEvent::ToolCallDelta {
                index, input_delta, ..
            } => {
                let openai_index = state
                    .openai_chat
                    .out_tool_indexes
                    .get(index)
                    .copied()
                    .unwrap_or(0);
                let mut delta = ChunkDelta::default();
                delta.tool_calls = Some(vec![ToolCallDelta {
                    index: openai_index,
                    id: None,
                    r#type: None,
                    function: Some(ToolCallDeltaFunction {
                        name: None,
                        arguments: Some(input_delta.clone()),
                    }),
                }]);
                out.push(encode_chunk(state, delta, None)?);
            }
            InternalStreamEvent::ContentBlockStop { .. } => {}
            InternalStreamEvent::Usage { usage } => {
                state.openai_chat.out_usage.merge_max(usage);
            }
            InternalStreamEvent::MessageStop { stop_reason, usage } => {
                if state.openai_chat.out_finished {
                    return Ok(out);
                }
                state.openai_chat.out_finished = true;
                out.push(encode_chunk(
                    state,
                    ChunkDelta::default(),
                    Some(finish_from_internal(*stop_reason)),
                )?);
                if let Some(usage) = usage {
                    state.openai_chat.out_usage.merge_max(usage);
                }
                let final_usage = state.openai_chat.out_usage;
                if !final_usage.is_empty() {
                    let chunk = ChatCompletionChunk {
                        id: state.openai_chat.out_id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created: state.openai_chat.out_created,
                        model: state.model.clone(),
                        choices: Vec::new(),
                        usage: Some(usage_from_internal(final_usage)),
                        system_fingerprint: None,
                        extra: JsonObject::new(),
                    };
                    out.push(encode_sse(None, &serde_json::to_string(&chunk)?));
                }
            }
            InternalStreamEvent::Error { error } => {
                let envelope = self.error_from_internal(error, None);
                out.push(encode_sse(None, &serde_json::to_string(&envelope)?));
            }
            InternalStreamEvent::Unknown { raw_type, .. } => {
                warn_unknown(FORMAT, raw_type);
            }
        }
        Ok(out)
    }

    fn stream_finish_from_internal(&self, state: &mut StreamState) -> Vec<Bytes> {
        if state.openai_chat.out_done_emitted {
            return Vec::new();
        }
        state.openai_chat.out_done_emitted = true;
        vec![Bytes::from_static(b"data: [DONE]\n\n")]
    }

    fn error_to_internal(&self, body: &JsonValue, status: Option<u16>) -> Option<InternalError> {
        let envelope: ErrorEnvelope = serde_json::from_value(body.clone()).ok()?;
        let kind = match envelope.error.r#type.as_deref() {
            Some("invalid_request_error") => ErrorKind::InvalidRequest,
            Some("authentication_error") => ErrorKind::Authentication,
            Some("permission_error") | Some("insufficient_quota") => ErrorKind::PermissionDenied,
            Some("not_found_error") => ErrorKind::NotFound,
            Some("rate_limit_error") | Some("rate_limit_exceeded") => ErrorKind::RateLimit,
            Some("server_error") | Some("api_error") => ErrorKind::ServerError,
            Some(_) | None => ErrorKind::Unknown,
        };
        let mut error = if kind == ErrorKind::Unknown
            && let Some(status) = status
        {
            InternalError::from_status(status, envelope.error.message)
        } else {
            InternalError::new(kind, envelope.error.message)
        };
        error.code = envelope.error.r#type;
        Some(error)
    }

    fn error_from_internal(&self, error: &InternalError, _request_id: Option<&str>) -> JsonValue {
        let type_name = match error.kind {
            ErrorKind::InvalidRequest
            | ErrorKind::ContextLengthExceeded
            | ErrorKind::ContentFiltered => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::PermissionDenied => "permission_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Overloaded | ErrorKind::ServerError | ErrorKind::Unknown => "server_error",
        };
        serde_json::to_value(ErrorEnvelope::new(type_name, error.message.clone()))
            .unwrap_or(JsonValue::Null)
    }
}

fn flush_incoming_stop(state: &mut StreamState) -> Vec<InternalStreamEvent> {
    let sub = &mut state.openai_chat;
    if !sub.started || sub.stopped {
        return Vec::new();
    }
    sub.stopped = true;
    let mut events = Vec::new();
    if let Some(index) = sub.text_block_index.take() {
        events.push(InternalStreamEvent::ContentBlockStop { index });
    }
    let mut tool_indexes: Vec<u32> = sub.tool_blocks.values().map(|(idx, _)| *idx).collect();
    tool_indexes.sort_unstable();
    for index in tool_indexes {
        events.push(InternalStreamEvent::ContentBlockStop { index });
    }
    events.push(InternalStreamEvent::MessageStop {
        stop_reason: sub.pending_stop.take(),
        usage: sub.pending_usage.take(),
    });
    events
}

fn encode_chunk(
    state: &StreamState,
    delta: ChunkDelta,
    finish_reason: Option<&str>,
) -> Result<Bytes, ConvertError> {
    let chunk = ChatCompletionChunk {
        id: state.openai_chat.out_id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: state.openai_chat.out_created,
        model: state.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(String::from),
            extra: JsonObject::new(),
        }],
        usage: None,
        system_fingerprint: None,
        extra: JsonObject::new(),
    };
    Ok(encode_sse(None, &serde_json::to_string(&chunk)?))
}

fn plain_message(role: &str, text: &str) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content: Some(MessageContent::Text(text.to_string())),
        name: None,
        tool_calls: None,
        tool_call_id: None,
        extra: JsonObject::new(),
    }
}

fn message_from_internal(message: &InternalMessage) -> Result<Vec<ChatMessage>, ConvertError> {
    let mut out = Vec::new();
    match message.role {
        Role::Assistant => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                        id: id.clone(),
                        r#type: "function".to_string(),
                        function: FunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input)?,
                        },
                    }),
                    ContentBlock::Unknown { raw_type, .. } => warn_unknown(FORMAT, raw_type),
                    _ => {}
                }
            }
            out.push(ChatMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(text))
                },
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                extra: JsonObject::new(),
            });
        }
        _ => {
            let mut parts = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => {
                        parts.push(ContentPart::Known(KnownContentPart::Text {
                            text: text.clone(),
                        }));
                    }
                    ContentBlock::Image {
                        data,
                        media_type,
                        url,
                    } => {
                        let url = if let Some(url) = url {
                            url.clone()
                        } else if let (Some(data), Some(media_type)) = (data, media_type) {
                            format!("data:{media_type};base64,{data}")
                        } else {
                            continue;
                        };
                        parts.push(ContentPart::Known(KnownContentPart::ImageUrl {
                            image_url: ImageUrl { url, detail: None },
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        output,
                        content_text,
                        ..
                    } => {
                        let text = content_text.clone().unwrap_or_else(|| {
                            output
                                .as_ref()
                                .map(|v| v.to_string())
                                .unwrap_or_default()
                        });
                        out.push(ChatMessage {
                            role: "tool".to_string(),
                            content: Some(MessageContent::Text(text)),
                            name: None,
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                            extra: JsonObject::new(),
                        });
                    }
                    ContentBlock::ToolUse { .. } => {}
                    ContentBlock::Unknown { raw_type, .. } => warn_unknown(FORMAT, raw_type),
                }
            }
            if !parts.is_empty() {
                let content = match parts.as_slice() {
                    [ContentPart::Known(KnownContentPart::Text { text })] => {
                        MessageContent::Text(text.clone())
                    }
                    _ => MessageContent::Parts(parts),
                };
                out.push(ChatMessage {
                    role: "user".to_string(),
                    content: Some(content),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                    extra: JsonObject::new(),
                });
            }
        }
    }
    Ok(out)
}

fn content_text(content: Option<&MessageContent>) -> String {
    match content {
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Known(KnownContentPart::Text { text }) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        None => String::new(),
    }
}

fn content_blocks(content: Option<&MessageContent>) -> Vec<ContentBlock> {
    match content {
        Some(MessageContent::Text(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Known(KnownContentPart::Text { text }) => {
                    ContentBlock::Text { text: text.clone() }
                }
                ContentPart::Known(KnownContentPart::ImageUrl { image_url }) => {
                    match parse_data_url(&image_url.url) {
                        Some((media_type, data)) => ContentBlock::Image {
                            data: Some(data),
                            media_type: Some(media_type),
                            url: None,
                        },
                        None => ContentBlock::Image {
                            data: None,
                            media_type: None,
                            url: Some(image_url.url.clone()),
                        },
                    }
                }
                ContentPart::Unknown(value) => ContentBlock::Unknown {
                    raw_type: raw_type_of(value),
                    payload: value.clone(),
                },
            })
            .collect(),
        None => Vec::new(),
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

fn parse_arguments(arguments: &str) -> JsonValue {
    if arguments.trim().is_empty() {
        return JsonValue::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| JsonValue::String(arguments.to_string()))
}

fn tool_choice_to_internal(value: &JsonValue) -> Option<ToolChoice> {
    match value {
        JsonValue::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Required),
            _ => None,
        },
        JsonValue::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())?;
            Some(ToolChoice::Tool {
                name: name.to_string(),
            })
        }
        _ => None,
    }
}

fn tool_choice_from_internal(choice: &ToolChoice) -> JsonValue {
    match choice {
        ToolChoice::Auto => JsonValue::String("auto".to_string()),
        ToolChoice::None => JsonValue::String("none".to_string()),
        ToolChoice::Required => JsonValue::String("required".to_string()),
        ToolChoice::Tool { name } => serde_json::json!({
            "type": "function",
            "function": { "name": name },
        }),
    }
}

fn finish_to_internal(finish: &str) -> StopReason {
    match finish {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFiltered,
        _ => StopReason::Unknown,
    }
}

fn finish_from_internal(stop: Option<StopReason>) -> &'static str {
    match stop {
        Some(StopReason::MaxTokens) => "length",
        Some(StopReason::ToolUse) => "tool_calls",
        Some(StopReason::ContentFiltered) | Some(StopReason::Refusal) => "content_filter",
        _ => "stop",
    }
}

fn usage_to_internal(usage: &ChatUsage) -> UsageInfo {
    UsageInfo {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

fn usage_from_internal(usage: UsageInfo) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        },
        prompt_tokens_details: (usage.cache_read_tokens > 0).then_some(PromptTokensDetails {
            cached_tokens: Some(usage.cache_read_tokens),
            extra: JsonObject::new(),
        }),
        extra: JsonObject::new(),
    }
}

fn ensure_chat_id(id: &str) -> String {
    if id.is_empty() {
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
