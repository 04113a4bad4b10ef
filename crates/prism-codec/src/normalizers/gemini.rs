use bytes::Bytes;

use prism_common::DataFormat;
use prism_protocol::gemini::generate::{
    Blob, Candidate, Content, ErrorEnvelope, FileData, FunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    Tool, UsageMetadata,
};
use prism_protocol::sse::{SseEvent, encode_sse};
use prism_protocol::{JsonObject, JsonValue};

use crate::error::ConvertError;
use crate::internal::{
    ContentBlock, ErrorKind, InstructionSegment, InternalError, InternalMessage, InternalRequest,
    InternalResponse, Role, StopReason, ToolSpec, UsageInfo,
};
use crate::registry::{Normalizer, warn_unknown};
use crate::stream_events::{BlockKind, InternalStreamEvent};
use crate::stream_state::StreamState;

pub struct GeminiNormalizer;

const FORMAT: DataFormat = DataFormat::Gemini;

impl Normalizer for GeminiNormalizer {
    fn data_format(&self) -> DataFormat {
        FORMAT
    }

    fn request_to_internal(&self, body: &JsonValue) -> Result<InternalRequest, ConvertError> {
        let req: GenerateContentRequest = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        // Gemini carries the model in the URL; the dispatcher fills it in.
        let mut internal = InternalRequest::new(String::new());
        if let Some(system) = req.system_instruction {
            let text = parts_text(&system.parts);
            if !text.is_empty() {
                internal.instructions.push(InstructionSegment {
                    role: Role::System,
                    text,
                });
            }
        }

        let mut call_counter = 0u32;
        for content in req.contents {
            let role = match content.role.as_deref() {
                Some("model") => Role::Assistant,
                _ => Role::User,
            };
            let mut blocks = Vec::new();
            for part in content.parts {
                blocks.push(part_to_internal(part, &mut call_counter));
            }
            internal.messages.push(InternalMessage {
                role,
                content: blocks,
            });
        }

        if let Some(config) = req.generation_config {
            internal.max_tokens = config.max_output_tokens;
            internal.temperature = config.temperature;
            internal.top_p = config.top_p;
            internal.top_k = config.top_k;
            internal.stop_sequences = config.stop_sequences;
        }
        internal.tools = req.tools.map(|tools| {
            tools
                .into_iter()
                .flat_map(|tool| tool.function_declarations.unwrap_or_default())
                .map(|decl| ToolSpec {
                    name: decl.name,
                    description: decl.description,
                    parameters: decl.parameters,
                })
                .collect()
        });
        internal.extra = req.extra;
        Ok(internal)
    }

    fn request_from_internal(&self, req: &InternalRequest) -> Result<JsonValue, ConvertError> {
        let mut contents = Vec::new();
        for message in &req.messages {
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = Vec::new();
            for block in &message.content {
                if let Some(part) = part_from_internal(block) {
                    parts.push(part);
                }
            }
            if !parts.is_empty() {
                contents.push(Content {
                    role: Some(role.to_string()),
                    parts,
                });
            }
        }

        let generation_config = GenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone(),
            extra: JsonObject::new(),
        };
        let has_config = generation_config != GenerationConfig::default();

        let out = GenerateContentRequest {
            contents,
            system_instruction: req.instruction_text().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text),
                    ..Part::default()
                }],
            }),
            generation_config: has_config.then_some(generation_config),
            tools: req.tools.as_ref().map(|tools| {
                vec![Tool {
                    function_declarations: Some(
                        tools
                            .iter()
                            .map(|tool| FunctionDeclaration {
                                name: tool.name.clone(),
                                description: tool.description.clone(),
                                parameters: tool.parameters.clone(),
                            })
                            .collect(),
                    ),
                    extra: JsonObject::new(),
                }]
            }),
            tool_config: None,
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(out)?)
    }

    fn response_to_internal(&self, body: &JsonValue) -> Result<InternalResponse, ConvertError> {
        let resp: GenerateContentResponse = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut content = Vec::new();
        let mut stop_reason = None;
        let mut call_counter = 0u32;
        if let Some(candidate) = resp.candidates.first() {
            if let Some(body) = &candidate.content {
                for part in body.parts.clone() {
                    content.push(part_to_internal(part, &mut call_counter));
                }
            }
            stop_reason = candidate.finish_reason.as_deref().map(finish_to_internal);
            if call_counter > 0 && stop_reason == Some(StopReason::EndTurn) {
                stop_reason = Some(StopReason::ToolUse);
            }
        }

        Ok(InternalResponse {
            id: resp
                .response_id
                .unwrap_or_else(|| format!("gen_{}", uuid::Uuid::new_v4().simple())),
            model: resp.model_version.unwrap_or_default(),
            content,
            stop_reason,
            usage: resp.usage_metadata.as_ref().map(usage_to_internal),
            extra: resp.extra,
        })
    }

    fn response_from_internal(&self, resp: &InternalResponse) -> Result<JsonValue, ConvertError> {
        let mut parts = Vec::new();
        for block in &resp.content {
            if let Some(part) = part_from_internal(block) {
                parts.push(part);
            }
        }

        let out = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: Some(finish_from_internal(resp.stop_reason).to_string()),
                index: Some(0),
                extra: JsonObject::new(),
            }],
            usage_metadata: resp.usage.map(usage_from_internal),
            model_version: (!resp.model.is_empty()).then(|| resp.model.clone()),
            response_id: Some(resp.id.clone()),
            prompt_feedback: None,
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
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }
        let value: JsonValue = serde_json::from_str(data)
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;
        if let Some(error) = self.error_to_internal(&value, None) {
            return Ok(vec![InternalStreamEvent::Error { error }]);
        }
        let chunk: GenerateContentResponse = serde_json::from_value(value)
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut events = Vec::new();
        if !state.gemini.started {
            state.gemini.started = true;
            state.message_id = chunk
                .response_id
                .clone()
                .unwrap_or_else(|| format!("gen_{}", uuid::Uuid::new_v4().simple()));
            state.model = chunk.model_version.clone().unwrap_or_default();
            events.push(InternalStreamEvent::MessageStart {
                message_id: state.message_id.clone(),
                model: state.model.clone(),
                usage: None,
            });
        }

        if let Some(candidate) = chunk.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        let sub = &mut state.gemini;
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
                    } else if let Some(call) = &part.function_call {
                        let sub = &mut state.gemini;
                        if let Some(text_index) = sub.text_block_index.take() {
                            events.push(InternalStreamEvent::ContentBlockStop {
                                index: text_index,
                            });
                        }
                        let index = sub.next_block_index;
                        sub.next_block_index += 1;
                        let tool_id = format!("call_{}", sub.tool_count);
                        sub.tool_count += 1;
                        let args = call
                            .args
                            .clone()
                            .unwrap_or(JsonValue::Object(serde_json::Map::new()));
                        events.push(InternalStreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::ToolUse,
                            tool_id: Some(tool_id.clone()),
                            tool_name: Some(call.name.clone()),
                        });
                        events.push(InternalStreamEvent::ToolCallDelta {
                            index,
                            tool_id,
                            input_delta: serde_json::to_string(&args)?,
                        });
                        events.push(InternalStreamEvent::ContentBlockStop { index });
                    }
                }
            }

            if let Some(finish) = &candidate.finish_reason {
                let sub = &mut state.gemini;
                if !sub.finished {
                    sub.finished = true;
                    if let Some(text_index) = sub.text_block_index.take() {
                        events.push(InternalStreamEvent::ContentBlockStop {
                            index: text_index,
                        });
                    }
                    let mut stop = finish_to_internal(finish);
                    if sub.tool_count > 0 && stop == StopReason::EndTurn {
                        stop = StopReason::ToolUse;
                    }
                    events.push(InternalStreamEvent::MessageStop {
                        stop_reason: Some(stop),
                        usage: chunk.usage_metadata.as_ref().map(usage_to_internal),
                    });
                }
            }
        }

        if !state.gemini.finished
            && let Some(usage) = &chunk.usage_metadata
        {
            events.push(InternalStreamEvent::Usage {
                usage: usage_to_internal(usage),
            });
        }

        Ok(events)
    }

    fn stream_finish_to_internal(&self, state: &mut StreamState) -> Vec<InternalStreamEvent> {
        let sub = &mut state.gemini;
        if !sub.started || sub.finished {
            return Vec::new();
        }
        sub.finished = true;
        let mut events = Vec::new();
        if let Some(index) = sub.text_block_index.take() {
            events.push(InternalStreamEvent::ContentBlockStop { index });
        }
        events.push(InternalStreamEvent::MessageStop {
            stop_reason: None,
            usage: None,
        });
        events
    }

    fn stream_event_from_internal(
        &self,
        event: &InternalStreamEvent,
        state: &mut StreamState,
    ) -> Result<Vec<Bytes>, ConvertError> {
        let mut out = Vec::new();
        match event {
            InternalStreamEvent::MessageStart { .. } => {}
            InternalStreamEvent::ContentBlockStart {
                index,
                kind,
                tool_name,
                ..
            } => {
                if *kind == BlockKind::ToolUse {
                    state.gemini.out_tools.insert(
                        *index,
                        (tool_name.clone().unwrap_or_default(), String::new()),
                    );
                }
            }
            InternalStreamEvent::ContentDelta { text, .. } => {
                out.push(encode_chunk(state, text_chunk(text), None)?);
            }
            InternalStreamEvent::ToolCallDelta {
                index, input_delta, ..
            } => {
                if let Some((_, buffer)) = state.gemini.out_tools.get_mut(index) {
                    buffer.push_str(input_delta);
                }
            }
            InternalStreamEvent::ContentBlockStop { index } => {
                if let Some((name, buffer)) = state.gemini.out_tools.remove(index) {
                    let args = if buffer.trim().is_empty() {
                        JsonValue::Object(serde_json::Map::new())
                    } else {
                        serde_json::from_str(&buffer)
                            .unwrap_or(JsonValue::String(buffer.clone()))
                    };
                    let part = Part {
                        function_call: Some(FunctionCall {
                            name,
                            args: Some(args),
                        }),
                        ..Part::default()
                    };
                    out.push(encode_chunk(state, part, None)?);
                }
            }
            InternalStreamEvent::Usage { usage } => {
                state.gemini.out_usage.merge_max(usage);
            }
            InternalStreamEvent::MessageStop { stop_reason, usage } => {
                if state.gemini.out_finished {
                    return Ok(out);
                }
                state.gemini.out_finished = true;
                if let Some(usage) = usage {
                    state.gemini.out_usage.merge_max(usage);
                }
                out.push(encode_final_chunk(state, *stop_reason)?);
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

    fn error_to_internal(&self, body: &JsonValue, status: Option<u16>) -> Option<InternalError> {
        let envelope: ErrorEnvelope = serde_json::from_value(body.clone()).ok()?;
        let kind = match envelope.error.status.as_deref() {
            Some("INVALID_ARGUMENT") | Some("FAILED_PRECONDITION") => ErrorKind::InvalidRequest,
            Some("UNAUTHENTICATED") => ErrorKind::Authentication,
            Some("PERMISSION_DENIED") => ErrorKind::PermissionDenied,
            Some("NOT_FOUND") => ErrorKind::NotFound,
            Some("RESOURCE_EXHAUSTED") => ErrorKind::RateLimit,
            Some("UNAVAILABLE") => ErrorKind::Overloaded,
            Some("INTERNAL") | Some("UNKNOWN") => ErrorKind::ServerError,
            _ => match envelope.error.code.or_else(|| status.map(i64::from)) {
                Some(code) => {
                    return Some(InternalError::from_status(
                        u16::try_from(code).unwrap_or(500),
                        envelope.error.message,
                    ));
                }
                None => ErrorKind::Unknown,
            },
        };
        let mut error = InternalError::new(kind, envelope.error.message);
        error.code = envelope.error.status;
        Some(error)
    }

    fn error_from_internal(&self, error: &InternalError, _request_id: Option<&str>) -> JsonValue {
        let status = match error.kind {
            ErrorKind::InvalidRequest
            | ErrorKind::ContextLengthExceeded
            | ErrorKind::ContentFiltered => "INVALID_ARGUMENT",
            ErrorKind::Authentication => "UNAUTHENTICATED",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimit => "RESOURCE_EXHAUSTED",
            ErrorKind::Overloaded => "UNAVAILABLE",
            ErrorKind::ServerError | ErrorKind::Unknown => "INTERNAL",
        };
        let envelope = ErrorEnvelope::new(
            status,
            error.message.clone(),
            Some(i64::from(error.http_status())),
        );
        serde_json::to_value(envelope).unwrap_or(JsonValue::Null)
    }
}

fn parts_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

fn part_to_internal(part: Part, call_counter: &mut u32) -> ContentBlock {
    if let Some(text) = part.text {
        return ContentBlock::Text { text };
    }
    if let Some(blob) = part.inline_data {
        return ContentBlock::Image {
            data: Some(blob.data),
            media_type: Some(blob.mime_type),
            url: None,
        };
    }
    if let Some(file) = part.file_data {
        return ContentBlock::Image {
            data: None,
            media_type: file.mime_type,
            url: Some(file.file_uri),
        };
    }
    if let Some(call) = part.function_call {
        let id = format!("call_{call_counter}");
        *call_counter += 1;
        return ContentBlock::ToolUse {
            id,
            name: call.name,
            input: call.args.unwrap_or(JsonValue::Object(serde_json::Map::new())),
        };
    }
    if let Some(response) = part.function_response {
        return ContentBlock::ToolResult {
            tool_use_id: response.name,
            output: Some(response.response),
            content_text: None,
            is_error: false,
        };
    }
    ContentBlock::Unknown {
        raw_type: "part".to_string(),
        payload: serde_json::to_value(part.extra).unwrap_or(JsonValue::Null),
    }
}

fn part_from_internal(block: &ContentBlock) -> Option<Part> {
    match block {
        ContentBlock::Text { text } => Some(Part {
            text: Some(text.clone()),
            ..Part::default()
        }),
        ContentBlock::Image {
            data,
            media_type,
            url,
        } => {
            if let (Some(data), Some(media_type)) = (data, media_type) {
                Some(Part {
                    inline_data: Some(Blob {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..Part::default()
                })
            } else {
                url.as_ref().map(|url| Part {
                    file_data: Some(FileData {
                        mime_type: media_type.clone(),
                        file_uri: url.clone(),
                    }),
                    ..Part::default()
                })
            }
        }
        ContentBlock::ToolUse { name, input, .. } => Some(Part {
            function_call: Some(FunctionCall {
                name: name.clone(),
                args: Some(input.clone()),
            }),
            ..Part::default()
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            content_text,
            ..
        } => {
            let response = match (output, content_text) {
                (Some(value), _) => value.clone(),
                (None, Some(text)) => serde_json::json!({ "result": text }),
                (None, None) => JsonValue::Object(serde_json::Map::new()),
            };
            Some(Part {
                function_response: Some(FunctionResponse {
                    name: tool_use_id.clone(),
                    response,
                }),
                ..Part::default()
            })
        }
        ContentBlock::Unknown { raw_type, .. } => {
            warn_unknown(FORMAT, raw_type);
            None
        }
    }
}

fn finish_to_internal(finish: &str) -> StopReason {
    match finish {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            StopReason::ContentFiltered
        }
        _ => StopReason::Unknown,
    }
}

fn finish_from_internal(stop: Option<StopReason>) -> &'static str {
    match stop {
        Some(StopReason::MaxTokens) => "MAX_TOKENS",
        Some(StopReason::ContentFiltered) | Some(StopReason::Refusal) => "SAFETY",
        _ => "STOP",
    }
}

fn usage_to_internal(usage: &UsageMetadata) -> UsageInfo {
    UsageInfo {
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        cache_read_tokens: usage.cached_content_token_count.unwrap_or(0),
        cache_write_tokens: 0,
    }
}

fn usage_from_internal(usage: UsageInfo) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.input_tokens),
        candidates_token_count: Some(usage.output_tokens),
        total_token_count: Some(if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        }),
        cached_content_token_count: (usage.cache_read_tokens > 0)
            .then_some(usage.cache_read_tokens),
        extra: JsonObject::new(),
    }
}

fn text_chunk(text: &str) -> Part {
    Part {
        text: Some(text.to_string()),
        ..Part::default()
    }
}

fn encode_chunk(
    state: &StreamState,
    part: Part,
    finish_reason: Option<&str>,
) -> Result<Bytes, ConvertError> {
    let chunk = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".to_string()),
                parts: vec![part],
            }),
            finish_reason: finish_reason.map(String::from),
            index: Some(0),
            extra: JsonObject::new(),
        }],
        usage_metadata: None,
        model_version: (!state.model.is_empty()).then(|| state.model.clone()),
        response_id: (!state.message_id.is_empty()).then(|| state.message_id.clone()),
        prompt_feedback: None,
        extra: JsonObject::new(),
    };
    Ok(encode_sse(None, &serde_json::to_string(&chunk)?))
}

fn encode_final_chunk(
    state: &StreamState,
    stop: Option<StopReason>,
) -> Result<Bytes, ConvertError> {
    let usage = state.gemini.out_usage;
    let chunk = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".to_string()),
                parts: Vec::new(),
            }),
            finish_reason: Some(finish_from_internal(stop).to_string()),
            index: Some(0),
            extra: JsonObject::new(),
        }],
        usage_metadata: (!usage.is_empty()).then(|| usage_from_internal(usage)),
        model_version: (!state.model.is_empty()).then(|| state.model.clone()),
        response_id: (!state.message_id.is_empty()).then(|| state.message_id.clone()),
        prompt_feedback: None,
        extra: JsonObject::new(),
    };
    Ok(encode_sse(None, &serde_json::to_string(&chunk)?))
}
