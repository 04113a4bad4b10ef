use bytes::Bytes;

use prism_common::DataFormat;
use prism_protocol::openai::error::ErrorEnvelope;
use prism_protocol::openai::responses::{
    CreateResponseRequest, InputItem, InputPart, InputTokensDetails, ItemContent, KnownInputItem,
    KnownInputPart, KnownOutputItem, KnownStreamEvent, OutputItem, ResponseBody, ResponseInput,
    ResponseUsage, StreamEvent, ToolDefinition,
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
use crate::stream_state::{OutItemAccum, StreamState};

pub struct OpenAiResponsesNormalizer;

const FORMAT: DataFormat = DataFormat::OpenAiResponses;

impl Normalizer for OpenAiResponsesNormalizer {
    fn data_format(&self) -> DataFormat {
        FORMAT
    }

    fn request_to_internal(&self, body: &JsonValue) -> Result<InternalRequest, ConvertError> {
        let req: CreateResponseRequest = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut internal = InternalRequest::new(req.model);
        if let Some(instructions) = req.instructions {
            internal.instructions.push(InstructionSegment {
                role: Role::System,
                text: instructions,
            });
        }

        match req.input {
            ResponseInput::Text(text) => internal.messages.push(InternalMessage {
                role: Role::User,
                content: vec![ContentBlock::Text { text }],
            }),
            ResponseInput::Items(items) => {
                for item in items {
                    match item {
                        InputItem::Known(KnownInputItem::Message { role, content }) => {
                            match role.as_str() {
                                "system" | "developer" => {
                                    let seg_role = if role == "developer" {
                                        Role::Developer
                                    } else {
                                        Role::System
                                    };
                                    internal.instructions.push(InstructionSegment {
                                        role: seg_role,
                                        text: item_content_text(&content),
                                    });
                                }
                                "assistant" => internal.messages.push(InternalMessage {
                                    role: Role::Assistant,
                                    content: item_content_blocks(content),
                                }),
                                _ => internal.messages.push(InternalMessage {
                                    role: Role::User,
                                    content: item_content_blocks(content),
                                }),
                            }
                        }
                        InputItem::Known(KnownInputItem::FunctionCall {
                            call_id,
                            name,
                            arguments,
                            ..
                        }) => internal.messages.push(InternalMessage {
                            role: Role::Assistant,
                            content: vec![ContentBlock::ToolUse {
                                id: call_id,
                                name,
                                input: serde_json::from_str(&arguments)
                                    .unwrap_or(JsonValue::String(arguments)),
                            }],
                        }),
                        InputItem::Known(KnownInputItem::FunctionCallOutput {
                            call_id,
                            output,
                        }) => {
                            let (output_value, content_text) = match output {
                                JsonValue::String(text) => (None, Some(text)),
                                other => (Some(other), None),
                            };
                            internal.messages.push(InternalMessage {
                                role: Role::Tool,
                                content: vec![ContentBlock::ToolResult {
                                    tool_use_id: call_id,
                                    output: output_value,
                                    content_text,
                                    is_error: false,
                                }],
                            });
                        }
                        InputItem::Unknown(value) => internal.messages.push(InternalMessage {
                            role: Role::Unknown,
                            content: vec![ContentBlock::Unknown {
                                raw_type: raw_type_of(&value),
                                payload: value,
                            }],
                        }),
                    }
                }
            }
        }

        internal.max_tokens = req.max_output_tokens;
        internal.temperature = req.temperature;
        internal.top_p = req.top_p;
        internal.stream = req.stream.unwrap_or(false);
        internal.tools = req.tools.map(|tools| {
            tools
                .into_iter()
                .filter_map(|tool| {
                    tool.name.map(|name| ToolSpec {
                        name,
                        description: tool.description,
                        parameters: tool.parameters,
                    })
                })
                .collect()
        });
        internal.tool_choice = req.tool_choice.as_ref().and_then(tool_choice_to_internal);
        internal.extra = req.extra;
        Ok(internal)
    }

    fn request_from_internal(&self, req: &InternalRequest) -> Result<JsonValue, ConvertError> {
        let mut items = Vec::new();
        for message in &req.messages {
            match message.role {
                Role::Assistant => {
                    let mut parts = Vec::new();
                    for block in &message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                parts.push(InputPart::Known(KnownInputPart::OutputText {
                                    text: text.clone(),
                                }));
                            }
                            ContentBlock::ToolUse { id, name, input } => {
                                items.push(InputItem::Known(KnownInputItem::FunctionCall {
                                    id: None,
                                    call_id: id.clone(),
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input)?,
                                }));
                            }
                            ContentBlock::Unknown { raw_type, .. } => {
                                warn_unknown(FORMAT, raw_type)
                            }
                            _ => {}
                        }
                    }
                    if !parts.is_empty() {
                        items.push(InputItem::Known(KnownInputItem::Message {
                            role: "assistant".to_string(),
                            content: ItemContent::Parts(parts),
                        }));
                    }
                }
                _ => {
                    let mut parts = Vec::new();
                    for block in &message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                parts.push(InputPart::Known(KnownInputPart::InputText {
                                    text: text.clone(),
                                }));
                            }
                            ContentBlock::Image {
                                data,
                                media_type,
                                url,
                            } => {
                                let image_url = if let Some(url) = url {
                                    url.clone()
                                } else if let (Some(data), Some(media_type)) = (data, media_type) {
                                    format!("data:{media_type};base64,{data}")
                                } else {
                                    continue;
                                };
                                parts.push(InputPart::Known(KnownInputPart::InputImage {
                                    image_url: Some(image_url),
                                    detail: None,
                                }));
                            }
                            ContentBlock::ToolResult {
                                tool_use_id,
                                output,
                                content_text,
                                ..
                            } => {
                                let output = match (content_text, output) {
                                    (Some(text), _) => JsonValue::String(text.clone()),
                                    (None, Some(value)) => value.clone(),
                                    (None, None) => JsonValue::String(String::new()),
                                };
                                items.push(InputItem::Known(
                                    KnownInputItem::FunctionCallOutput {
                                        call_id: tool_use_id.clone(),
                                        output,
                                    },
                                ));
                            }
                            ContentBlock::ToolUse { .. } => {}
                            ContentBlock::Unknown { raw_type, .. } => {
                                warn_unknown(FORMAT, raw_type)
                            }
                        }
                    }
                    if !parts.is_empty() {
                        items.push(InputItem::Known(KnownInputItem::Message {
                            role: "user".to_string(),
                            content: ItemContent::Parts(parts),
                        }));
                    }
                }
            }
        }

        let out = CreateResponseRequest {
            model: req.model.clone(),
            input: ResponseInput::Items(items),
            instructions: req.instruction_text(),
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stream: req.stream.then_some(true),
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| ToolDefinition {
                        r#type: "function".to_string(),
                        name: Some(tool.name.clone()),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                        extra: JsonObject::new(),
                    })
                    .collect()
            }),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_from_internal),
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(out)?)
    }

    fn response_to_internal(&self, body: &JsonValue) -> Result<InternalResponse, ConvertError> {
        let resp: ResponseBody = serde_json::from_value(body.clone())
            .map_err(|err| ConvertError::invalid(FORMAT, err.to_string()))?;

        let mut content = Vec::new();
        let mut has_tool_call = false;
        for item in &resp.output {
            match item {
                OutputItem::Known(KnownOutputItem::Message { content: parts, .. }) => {
                    for part in parts {
                        if let InputPart::Known(
                            KnownInputPart::OutputText { text } | KnownInputPart::InputText { text },
                        ) = part
                        {
                            content.push(ContentBlock::Text { text: text.clone() });
                        }
                    }
                }
                OutputItem::Known(KnownOutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                }) => {
                    has_tool_call = true;
                    content.push(ContentBlock::ToolUse {
                        id: call_id.clone(),
                        name: name.clone(),
                        input: serde_json::from_str(arguments)
                            .unwrap_or(JsonValue::String(arguments.clone())),
                    });
                }
                OutputItem::Unknown(value) => content.push(ContentBlock::Unknown {
                    raw_type: raw_type_of(value),
                    payload: value.clone(),
                }),
            }
        }

        let stop_reason = if has_tool_call {
            Some(StopReason::ToolUse)
        } else {
            match resp.status.as_deref() {
                Some("completed") => Some(StopReason::EndTurn),
                Some("incomplete") => Some(StopReason::MaxTokens),
                _ => None,
            }
        };

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
        let mut output = Vec::new();
        let mut text_parts = Vec::new();
        for block in &resp.content {
            match block {
                ContentBlock::Text { text } => {
                    text_parts.push(InputPart::Known(KnownInputPart::OutputText {
                        text: text.clone(),
                    }));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    output.push(OutputItem::Known(KnownOutputItem::FunctionCall {
                        id: None,
                        call_id: id.clone(),
                        name: name.clone(),
                        arguments: serde_json::to_string(input)?,
                        status: Some("completed".to_string()),
                    }));
                }
                ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {
                    return Err(ConvertError::unsupported(
                        FORMAT,
                        FORMAT,
                        "non-text content in a response output",
                    ));
                }
                ContentBlock::Unknown { raw_type, .. } => warn_unknown(FORMAT, raw_type),
            }
        }
        if !text_parts.is_empty() {
            output.insert(
                0,
                OutputItem::Known(KnownOutputItem::Message {
                    id: Some(format!("msg_{}", uuid::Uuid::new_v4().simple())),
                    role: "assistant".to_string(),
                    content: text_parts,
                    status: Some("completed".to_string()),
                }),
            );
        }

        let body = ResponseBody {
            id: ensure_response_id(&resp.id),
            object: "response".to_string(),
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            model: resp.model.clone(),
            status: Some("completed".to_string()),
            output,
            usage: resp.usage.map(usage_from_internal),
            error: None,
            incomplete_details: None,
            extra: JsonObject::new(),
        };
        Ok(serde_json::to_value(body)?)
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
                return Ok(vec![InternalStreamEvent::Unknown {
                    raw_type: raw_type_of(&value),
                    payload: value,
                }]);
            }
        };

        let mut events = Vec::new();
        match known {
            KnownStreamEvent::Created { response } => {
                if !state.openai_responses.started {
                    state.openai_responses.started = true;
                    state.message_id = response.id.clone();
                    state.model = response.model.clone();
                    events.push(InternalStreamEvent::MessageStart {
                        message_id: response.id,
                        model: response.model,
                        usage: None,
                    });
                }
            }
            KnownStreamEvent::InProgress { .. } => {}
            KnownStreamEvent::OutputItemAdded { output_index, item } => {
                let sub = &mut state.openai_responses;
                let index = sub.next_block_index;
                sub.next_block_index += 1;
                match item {
                    OutputItem::Known(KnownOutputItem::Message { .. }) => {
                        sub.items.insert(output_index, (index, BlockKind::Text, None));
                        events.push(InternalStreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::Text,
                            tool_id: None,
                            tool_name: None,
                        });
                    }
                    OutputItem::Known(KnownOutputItem::FunctionCall {
                        call_id, name, ..
                    }) => {
                        sub.items
                            .insert(output_index, (index, BlockKind::ToolUse, Some(call_id.clone())));
                        events.push(InternalStreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::ToolUse,
                            tool_id: Some(call_id),
                            tool_name: Some(name),
                        });
                    }
                    OutputItem::Unknown(value) => {
                        sub.next_block_index -= 1;
                        events.push(InternalStreamEvent::Unknown {
                            raw_type: raw_type_of(&value),
                            payload: value,
                        });
                    }
                }
            }
            KnownStreamEvent::OutputTextDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some((index, _, _)) = state.openai_responses.items.get(&output_index) {
                    events.push(InternalStreamEvent::ContentDelta {
                        index: *index,
                        text: delta,
                    });
                }
            }
            KnownStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some((index, _, tool_id)) = state.openai_responses.items.get(&output_index) {
                    events.push(InternalStreamEvent::ToolCallDelta {
                        index: *index,
                        tool_id: tool_id.clone().unwrap_or_default(),
                        input_delta: delta,
                    });
                }
            }
            KnownStreamEvent::OutputItemDone { output_index, .. } => {
                if let Some((index, _, _)) = state.openai_responses.items.remove(&output_index) {
                    events.push(InternalStreamEvent::ContentBlockStop { index });
                }
            }
            KnownStreamEvent::Completed { response } => {
                let sub = &mut state.openai_responses;
                let mut open: Vec<u32> = sub.items.values().map(|(idx, _, _)| *idx).collect();
                open.sort_unstable();
                sub.items.clear();
                for index in open {
                    events.push(InternalStreamEvent::ContentBlockStop { index });
                }
                let has_tool_call = response.output.iter().any(|item| {
                    matches!(item, OutputItem::Known(KnownOutputItem::FunctionCall { .. }))
                });
                events.push(InternalStreamEvent::MessageStop {
                    stop_reason: Some(if has_tool_call {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    }),
                    usage: response.usage.as_ref().map(usage_to_internal),
                });
            }
            KnownStreamEvent::Failed { response } => {
                let error = response
                    .error
                    .as_ref()
                    .and_then(|value| {
                        let message = value.get("message")?.as_str()?;
                        Some(InternalError::new(ErrorKind::ServerError, message))
                    })
                    .unwrap_or_else(|| {
                        InternalError::new(ErrorKind::ServerError, "response failed")
                    });
                events.push(InternalStreamEvent::Error { error });
            }
            KnownStreamEvent::Error { message, .. } => {
                events.push(InternalStreamEvent::Error {
                    error: InternalError::new(ErrorKind::ServerError, message),
                });
            }
        }
        Ok(events)
    }

    fn stream_event_from_internal(
        &self,
        event: &InternalStreamEvent,
        state: &mut StreamState,
    ) -> Result<Vec<Bytes>, ConvertError> {
        let mut out = Vec::new();
        match event {
            InternalStreamEvent::MessageStart { model, .. } => {
                let sub = &mut state.openai_responses;
                if !sub.out_started {
                    sub.out_started = true;
                    sub.out_id = ensure_response_id("");
                    if state.model.is_empty() {
                        state.model = model.clone();
                    }
                    let body = response_skeleton(&sub.out_id, &state.model, "in_progress", None);
                    out.push(encode_event(&KnownStreamEvent::Created { response: body })?);
                }
            }
            InternalStreamEvent::ContentBlockStart {
                index,
                kind,
                tool_id,
                tool_name,
            } => {
                let sub = &mut state.openai_responses;
                let output_index = sub.out_items.len() as u32;
                sub.out_index_map.insert(*index, output_index);
                let accum = OutItemAccum {
                    kind: *kind,
                    item_id: format!(
                        "{}_{}",
                        if *kind == BlockKind::Text { "msg" } else { "fc" },
                        uuid::Uuid::new_v4().simple()
                    ),
                    call_id: tool_id.clone(),
                    tool_name: tool_name.clone(),
                    buffer: String::new(),
                    done: false,
                };
                let item = accum_to_item(&accum, "in_progress");
                sub.out_items.push(accum);
                out.push(encode_event(&KnownStreamEvent::OutputItemAdded {
                    output_index,
                    item,
                })?);
            }
            InternalStreamEvent::ContentDelta { index, text } => {
                let sub = &mut state.openai_responses;
                if let Some(output_index) = sub.out_index_map.get(index).copied() {
                    if let Some(accum) = sub.out_items.get_mut(output_index as usize) {
                        accum.buffer.push_str(text);
                        let item_id = accum.item_id.clone();
                        out.push(encode_event(&KnownStreamEvent::OutputTextDelta {
                            output_index,
                            item_id: Some(item_id),
                            delta: text.clone(),
                        })?);
                    }
                }
            }
            InternalStreamEvent::ToolCallDelta {
                index, input_delta, ..
            } => {
                let sub = &mut state.openai_responses;
                if let Some(output_index) = sub.out_index_map.get(index).copied() {
                    if let Some(accum) = sub.out_items.get_mut(output_index as usize) {
                        accum.buffer.push_str(input_delta);
                        let item_id = accum.item_id.clone();
                        out.push(encode_event(
                            &KnownStreamEvent::FunctionCallArgumentsDelta {
                                output_index,
                                item_id: Some(item_id),
                                delta: input_delta.clone(),
                            },
                        )?);
                    }
                }
            }
            InternalStreamEvent::ContentBlockStop { index } => {
                let sub = &mut state.openai_responses;
                if let Some(output_index) = sub.out_index_map.get(index).copied() {
                    if let Some(accum) = sub.out_items.get_mut(output_index as usize) {
                        if !accum.done {
                            accum.done = true;
                            let item = accum_to_item(accum, "completed");
                            out.push(encode_event(&KnownStreamEvent::OutputItemDone {
                                output_index,
                                item,
                            })?);
                        }
                    }
                }
            }
            InternalStreamEvent::Usage { usage } => {
                state.openai_responses.out_usage.merge_max(usage);
            }
            InternalStreamEvent::MessageStop { usage, .. } => {
                let sub = &mut state.openai_responses;
                if sub.out_finished {
                    return Ok(out);
                }
                sub.out_finished = true;
                if let Some(usage) = usage {
                    sub.out_usage.merge_max(usage);
                }
                // Close any item the source never finished.
                for output_index in 0..sub.out_items.len() {
                    let accum = &mut sub.out_items[output_index];
                    if !accum.done {
                        accum.done = true;
                        let item = accum_to_item(accum, "completed");
                        out.push(encode_event(&KnownStreamEvent::OutputItemDone {
                            output_index: output_index as u32,
                            item,
                        })?);
                    }
                }
                let mut body =
                    response_skeleton(&sub.out_id, &state.model, "completed", Some(sub.out_usage));
                body.output = sub
                    .out_items
                    .iter()
                    .map(|accum| accum_to_item(accum, "completed"))
                    .collect();
                out.push(encode_event(&KnownStreamEvent::Completed { response: body })?);
            }
            InternalStreamEvent::Error { error } => {
                out.push(encode_event(&KnownStreamEvent::Error {
                    code: error.code.clone().map(JsonValue::String),
                    message: error.message.clone(),
                })?);
            }
            InternalStreamEvent::Unknown { raw_type, .. } => {
                warn_unknown(FORMAT, raw_type);
            }
        }
        Ok(out)
    }

    fn error_to_internal(&self, body: &JsonValue, status: Option<u16>) -> Option<InternalError> {
        // Same envelope as Chat Completions; a failed Response body also
        // carries a top-level `error` object.
        let envelope: ErrorEnvelope = serde_json::from_value(body.clone()).ok()?;
        let mut error = match status {
            Some(status) => InternalError::from_status(status, envelope.error.message),
            None => InternalError::new(ErrorKind::Unknown, envelope.error.message),
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

fn item_content_text(content: &ItemContent) -> String {
    match content {
        ItemContent::Text(text) => text.clone(),
        ItemContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                InputPart::Known(
                    KnownInputPart::InputText { text } | KnownInputPart::OutputText { text },
                ) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn item_content_blocks(content: ItemContent) -> Vec<ContentBlock> {
    match content {
        ItemContent::Text(text) => vec![ContentBlock::Text { text }],
        ItemContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                InputPart::Known(
                    KnownInputPart::InputText { text } | KnownInputPart::OutputText { text },
                ) => Some(ContentBlock::Text { text }),
                InputPart::Known(KnownInputPart::InputImage { image_url, .. }) => {
                    image_url.map(|url| match url.strip_prefix("data:") {
                        Some(rest) => match rest.split_once(";base64,") {
                            Some((media_type, data)) => ContentBlock::Image {
                                data: Some(data.to_string()),
                                media_type: Some(media_type.to_string()),
                                url: None,
                            },
                            None => ContentBlock::Image {
                                data: None,
                                media_type: None,
                                url: Some(url.clone()),
                            },
                        },
                        None => ContentBlock::Image {
                            data: None,
                            media_type: None,
                            url: Some(url),
                        },
                    })
                }
                InputPart::Unknown(value) => Some(ContentBlock::Unknown {
                    raw_type: raw_type_of(&value),
                    payload: value,
                }),
            })
            .collect(),
    }
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
            let name = obj.get("name").and_then(|n| n.as_str())?;
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
            "name": name,
        }),
    }
}

fn usage_to_internal(usage: &ResponseUsage) -> UsageInfo {
    UsageInfo {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .input_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

fn usage_from_internal(usage: UsageInfo) -> ResponseUsage {
    ResponseUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        },
        input_tokens_details: (usage.cache_read_tokens > 0).then_some(InputTokensDetails {
            cached_tokens: Some(usage.cache_read_tokens),
            extra: JsonObject::new(),
        }),
        extra: JsonObject::new(),
    }
}

fn response_skeleton(
    id: &str,
    model: &str,
    status: &str,
    usage: Option<UsageInfo>,
) -> ResponseBody {
    ResponseBody {
        id: id.to_string(),
        object: "response".to_string(),
        created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        status: Some(status.to_string()),
        output: Vec::new(),
        usage: usage.map(usage_from_internal),
        error: None,
        incomplete_details: None,
        extra: JsonObject::new(),
    }
}

fn accum_to_item(accum: &OutItemAccum, status: &str) -> OutputItem {
    match accum.kind {
        BlockKind::Text => OutputItem::Known(KnownOutputItem::Message {
            id: Some(accum.item_id.clone()),
            role: "assistant".to_string(),
            content: if accum.buffer.is_empty() {
                Vec::new()
            } else {
                vec![InputPart::Known(KnownInputPart::OutputText {
                    text: accum.buffer.clone(),
                })]
            },
            status: Some(status.to_string()),
        }),
        BlockKind::ToolUse => OutputItem::Known(KnownOutputItem::FunctionCall {
            id: Some(accum.item_id.clone()),
            call_id: accum.call_id.clone().unwrap_or_default(),
            name: accum.tool_name.clone().unwrap_or_default(),
            arguments: accum.buffer.clone(),
            status: Some(status.to_string()),
        }),
    }
}

fn encode_event(event: &KnownStreamEvent) -> Result<Bytes, ConvertError> {
    let value = serde_json::to_value(event)?;
    let name = value.get("type").and_then(|v| v.as_str()).map(String::from);
    let data = serde_json::to_string(&value)?;
    Ok(encode_sse(name.as_deref(), &data))
}

fn ensure_response_id(id: &str) -> String {
    if id.is_empty() {
        format!("resp_{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    }
}
