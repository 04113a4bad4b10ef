use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use prism_codec::{ErrorKind, InternalError};
use prism_common::{ApiFormat, new_request_id};
use prism_core::{ClientRequest, DispatchReply, ReplyBody};

use crate::AppState;
use crate::auth::{authenticate, extract_client_key, quota_available};

pub async fn claude_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, ApiFormat::Claude, headers, None, None, body).await
}

pub async fn openai_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, ApiFormat::OpenAi, headers, None, None, body).await
}

pub async fn openai_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, ApiFormat::OpenAiCli, headers, None, None, body).await
}

pub async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            ApiFormat::Gemini,
            400,
            ErrorKind::InvalidRequest,
            "missing model action",
        );
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return error_response(
                ApiFormat::Gemini,
                400,
                ErrorKind::InvalidRequest,
                "unknown model action",
            );
        }
    };
    handle(
        state,
        ApiFormat::Gemini,
        headers,
        query,
        Some((model.to_string(), stream)),
        body,
    )
    .await
}

async fn handle(
    state: AppState,
    entry_format: ApiFormat,
    headers: HeaderMap,
    query: Option<String>,
    gemini_call: Option<(String, bool)>,
    body: Bytes,
) -> Response {
    let Some((presented, client_format)) =
        extract_client_key(entry_format, &headers, query.as_deref())
    else {
        return error_response(
            entry_format,
            401,
            ErrorKind::Authentication,
            "missing api key",
        );
    };

    let snapshot = state.catalog.load();
    let Some(auth) = authenticate(&snapshot, &presented) else {
        return error_response(
            entry_format,
            401,
            ErrorKind::Authentication,
            "invalid api key",
        );
    };
    if !quota_available(&auth) {
        return error_response(
            client_format,
            429,
            ErrorKind::RateLimit,
            "quota exceeded",
        );
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(
                client_format,
                400,
                ErrorKind::InvalidRequest,
                format!("invalid json: {err}"),
            );
        }
    };

    let (model, stream) = match &gemini_call {
        Some((model, stream)) => (model.clone(), *stream),
        None => {
            let model = parsed
                .get("model")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            if model.is_empty() {
                return error_response(
                    client_format,
                    400,
                    ErrorKind::InvalidRequest,
                    "missing model",
                );
            }
            let stream = parsed
                .get("stream")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            (model, stream)
        }
    };

    let request = ClientRequest {
        format: client_format,
        model,
        stream,
        body: parsed,
    };

    match state.dispatcher.dispatch(auth, request).await {
        Ok(reply) => reply_response(reply),
        Err(err) => {
            let body = serde_json::to_vec(&err.body).unwrap_or_default();
            json_response(err.status, body)
        }
    }
}

fn reply_response(reply: DispatchReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    match reply.body {
        ReplyBody::Full(bytes) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, reply.content_type)
            .header("x-request-id", reply.request_id)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        ReplyBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<Bytes, std::convert::Infallible>);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, reply.content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-request-id", reply.request_id)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn error_response(
    format: ApiFormat,
    status: u16,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Response {
    let request_id = new_request_id();
    let normalizer = prism_codec::normalizer(format.data_format());
    let error = InternalError::new(kind, message);
    let body = normalizer.error_from_internal(&error, Some(&request_id));
    json_response(status, serde_json::to_vec(&body).unwrap_or_default())
}

fn json_response(status: u16, body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
