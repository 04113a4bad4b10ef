use prism_common::ApiFormat;
use prism_protocol::sse::SseEvent;
use serde_json::json;

use super::*;

fn claude_request() -> serde_json::Value {
    json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "system": "be terse",
        "stream": true,
        "messages": [
            { "role": "user", "content": "hi" }
        ]
    })
}

#[test]
fn claude_round_trip_keeps_common_fields() {
    let body = claude_request();
    let out = convert_request(ApiFormat::Claude, ApiFormat::Claude, &body).unwrap();
    assert_eq!(out["model"], "claude-sonnet-4-5");
    assert_eq!(out["max_tokens"], 512);
    assert_eq!(out["system"], "be terse");
    assert_eq!(out["stream"], true);
    assert_eq!(out["messages"][0]["role"], "user");
    assert_eq!(out["messages"][0]["content"][0]["text"], "hi");
}

#[test]
fn claude_to_openai_chat_request() {
    let body = claude_request();
    let out = convert_request(ApiFormat::Claude, ApiFormat::OpenAi, &body).unwrap();
    assert_eq!(out["model"], "claude-sonnet-4-5");
    assert_eq!(out["stream"], true);
    // System prompt becomes the leading system message.
    assert_eq!(out["messages"][0]["role"], "system");
    assert_eq!(out["messages"][0]["content"], "be terse");
    assert_eq!(out["messages"][1]["role"], "user");
    assert_eq!(out["messages"][1]["content"], "hi");
    // Usage chunk is required for metering.
    assert_eq!(out["stream_options"]["include_usage"], true);
}

#[test]
fn openai_chat_to_claude_tool_request() {
    let body = json!({
        "model": "gpt-4o",
        "messages": [
            { "role": "user", "content": "weather?" },
            { "role": "assistant", "tool_calls": [
                { "id": "call_1", "type": "function",
                  "function": { "name": "get_weather", "arguments": "{\"city\":\"SF\"}" } }
            ]},
            { "role": "tool", "tool_call_id": "call_1", "content": "sunny" }
        ],
        "tools": [
            { "type": "function",
              "function": { "name": "get_weather", "parameters": { "type": "object" } } }
        ]
    });
    let out = convert_request(ApiFormat::OpenAi, ApiFormat::Claude, &body).unwrap();
    assert_eq!(out["tools"][0]["name"], "get_weather");
    let assistant = &out["messages"][1];
    assert_eq!(assistant["role"], "assistant");
    assert_eq!(assistant["content"][0]["type"], "tool_use");
    assert_eq!(assistant["content"][0]["id"], "call_1");
    assert_eq!(assistant["content"][0]["input"]["city"], "SF");
    let result = &out["messages"][2];
    assert_eq!(result["role"], "user");
    assert_eq!(result["content"][0]["type"], "tool_result");
    assert_eq!(result["content"][0]["tool_use_id"], "call_1");
}

#[test]
fn claude_to_gemini_request_moves_model_out_of_body() {
    let body = claude_request();
    let out = convert_request(ApiFormat::Claude, ApiFormat::Gemini, &body).unwrap();
    assert!(out.get("model").is_none());
    assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be terse");
    assert_eq!(out["contents"][0]["role"], "user");
    assert_eq!(out["contents"][0]["parts"][0]["text"], "hi");
    assert_eq!(out["generationConfig"]["maxOutputTokens"], 512);
}

#[test]
fn openai_response_to_claude_response() {
    let body = json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 0,
        "model": "gpt-4o",
        "choices": [
            { "index": 0, "finish_reason": "stop",
              "message": { "role": "assistant", "content": "hello" } }
        ],
        "usage": {
            "prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10,
            "prompt_tokens_details": { "cached_tokens": 2 }
        }
    });
    let out = convert_response(ApiFormat::OpenAi, ApiFormat::Claude, &body).unwrap();
    assert_eq!(out["type"], "message");
    assert_eq!(out["role"], "assistant");
    assert_eq!(out["content"][0]["text"], "hello");
    assert_eq!(out["stop_reason"], "end_turn");
    assert_eq!(out["usage"]["input_tokens"], 3);
    assert_eq!(out["usage"]["output_tokens"], 7);
    assert_eq!(out["usage"]["cache_read_input_tokens"], 2);
}

fn chat_chunk(data: serde_json::Value) -> SseEvent {
    SseEvent {
        event: None,
        data: data.to_string(),
    }
}

#[test]
fn openai_chat_stream_converts_to_claude_events() {
    let mut converter = StreamConverter::converting(ApiFormat::Claude, ApiFormat::OpenAi);
    let mut frames = Vec::new();

    frames.extend(
        converter
            .push_event(&chat_chunk(json!({
                "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 0,
                "model": "gpt-4o",
                "choices": [{ "index": 0, "delta": { "role": "assistant", "content": "hi" } }]
            })))
            .unwrap(),
    );
    frames.extend(
        converter
            .push_event(&chat_chunk(json!({
                "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 0,
                "model": "gpt-4o",
                "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }]
            })))
            .unwrap(),
    );
    frames.extend(
        converter
            .push_event(&chat_chunk(json!({
                "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 0,
                "model": "gpt-4o", "choices": [],
                "usage": { "prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10 }
            })))
            .unwrap(),
    );
    frames.extend(
        converter
            .push_event(&SseEvent {
                event: None,
                data: "[DONE]".to_string(),
            })
            .unwrap(),
    );
    frames.extend(converter.finish().unwrap());

    let text = frames
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect::<String>();
    let order = [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ];
    let mut pos = 0;
    for marker in order {
        let found = text[pos..].find(marker).unwrap_or_else(|| {
            panic!("missing {marker} after byte {pos} in:\n{text}");
        });
        pos += found;
    }

    assert_eq!(converter.usage().input_tokens, 3);
    assert_eq!(converter.usage().output_tokens, 7);
    assert_eq!(converter.stop_reason(), Some(StopReason::EndTurn));
}

#[test]
fn claude_stream_scans_usage_in_passthrough() {
    let mut converter = StreamConverter::passthrough(ApiFormat::Claude);
    let start = json!({
        "type": "message_start",
        "message": {
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4-5", "content": [],
            "usage": { "input_tokens": 3, "output_tokens": 1 }
        }
    });
    let delta = json!({
        "type": "message_delta",
        "delta": { "stop_reason": "end_turn" },
        "usage": { "input_tokens": 3, "output_tokens": 7 }
    });
    let stop = json!({ "type": "message_stop" });

    for (name, body) in [
        ("message_start", start),
        ("message_delta", delta),
        ("message_stop", stop),
    ] {
        let frames = converter
            .push_event(&SseEvent {
                event: Some(name.to_string()),
                data: body.to_string(),
            })
            .unwrap();
        assert!(frames.is_empty(), "passthrough must not emit frames");
    }

    assert_eq!(converter.usage().input_tokens, 3);
    assert_eq!(converter.usage().output_tokens, 7);
    assert_eq!(converter.stop_reason(), Some(StopReason::EndTurn));
}

#[test]
fn gemini_embedded_error_is_detected() {
    let data = json!({
        "error": { "message": "quota exhausted", "status": "RESOURCE_EXHAUSTED" }
    })
    .to_string();
    let error = peek_embedded_error(ApiFormat::Gemini, &data).unwrap();
    assert_eq!(error.kind, ErrorKind::RateLimit);
    assert!(error.retryable);

    let ok = json!({ "candidates": [] }).to_string();
    assert!(peek_embedded_error(ApiFormat::Gemini, &ok).is_none());
}

#[test]
fn upstream_error_is_rendered_in_client_dialect() {
    let upstream = json!({
        "error": { "message": "too fast", "status": "RESOURCE_EXHAUSTED", "code": 429 }
    });
    let body = convert_error_body(
        ApiFormat::Gemini,
        ApiFormat::Claude,
        429,
        upstream.to_string().as_bytes(),
        Some("req-1"),
    );
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["request_id"], "req-1");
}

#[test]
fn unparseable_error_body_falls_back_to_status() {
    let body = convert_error_body(
        ApiFormat::OpenAi,
        ApiFormat::OpenAi,
        503,
        b"upstream blew up",
        None,
    );
    assert_eq!(body["error"]["type"], "server_error");
    assert_eq!(body["error"]["message"], "upstream blew up");
}

#[test]
fn gemini_stream_to_openai_chat() {
    let mut converter = StreamConverter::converting(ApiFormat::OpenAi, ApiFormat::Gemini);
    let mut frames = Vec::new();
    frames.extend(
        converter
            .push_event(&chat_chunk(json!({
                "candidates": [
                    { "content": { "role": "model", "parts": [{ "text": "hel" }] } }
                ],
                "responseId": "gen-1", "modelVersion": "gemini-2.0-flash"
            })))
            .unwrap(),
    );
    frames.extend(
        converter
            .push_event(&chat_chunk(json!({
                "candidates": [
                    { "content": { "role": "model", "parts": [{ "text": "lo" }] },
                      "finishReason": "STOP" }
                ],
                "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2 }
            })))
            .unwrap(),
    );
    frames.extend(converter.finish().unwrap());

    let text = frames
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect::<String>();
    assert!(text.contains("\"content\":\"hel\""), "stream text missing: {text}");
    assert!(text.contains("\"content\":\"lo\""));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
    assert_eq!(converter.usage().input_tokens, 5);
    assert_eq!(converter.usage().output_tokens, 2);
}

#[test]
fn claude_stream_to_openai_responses_events() {
    let mut converter = StreamConverter::converting(ApiFormat::OpenAiCli, ApiFormat::Claude);
    let push = |conv: &mut StreamConverter, name: &str, body: serde_json::Value| {
        conv.push_event(&SseEvent {
            event: Some(name.to_string()),
            data: body.to_string(),
        })
        .unwrap()
    };

    let mut frames = Vec::new();
    frames.extend(push(
        &mut converter,
        "message_start",
        json!({
            "type": "message_start",
            "message": { "id": "msg_1", "type": "message", "role": "assistant",
                         "model": "claude-sonnet-4-5", "content": [], "usage": {} }
        }),
    ));
    frames.extend(push(
        &mut converter,
        "content_block_start",
        json!({ "type": "content_block_start", "index": 0,
                "content_block": { "type": "text", "text": "" } }),
    ));
    frames.extend(push(
        &mut converter,
        "content_block_delta",
        json!({ "type": "content_block_delta", "index": 0,
                "delta": { "type": "text_delta", "text": "hi" } }),
    ));
    frames.extend(push(
        &mut converter,
        "content_block_stop",
        json!({ "type": "content_block_stop", "index": 0 }),
    ));
    frames.extend(push(
        &mut converter,
        "message_delta",
        json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" },
                "usage": { "output_tokens": 1 } }),
    ));
    frames.extend(push(
        &mut converter,
        "message_stop",
        json!({ "type": "message_stop" }),
    ));
    frames.extend(converter.finish().unwrap());

    let text = frames
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect::<String>();
    for marker in [
        "event: response.created",
        "event: response.output_item.added",
        "event: response.output_text.delta",
        "event: response.output_item.done",
        "event: response.completed",
    ] {
        assert!(text.contains(marker), "missing {marker} in:\n{text}");
    }
}
