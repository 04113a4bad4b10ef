use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::json;

use prism_common::ApiFormat;

use crate::AppState;

/// Dialect-detected model listing under `/v1/models`. The Anthropic
/// version header and the Google key header identify their callers; the
/// default shape is OpenAI's.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let format = if headers.contains_key("anthropic-version") {
        ApiFormat::Claude
    } else if headers.contains_key("x-goog-api-key") {
        ApiFormat::Gemini
    } else {
        ApiFormat::OpenAi
    };
    render_listing(&state, format)
}

pub async fn gemini_list_models(State(state): State<AppState>) -> Response {
    render_listing(&state, ApiFormat::Gemini)
}

fn render_listing(state: &AppState, format: ApiFormat) -> Response {
    let snapshot = state.catalog.load();
    let models: Vec<_> = snapshot
        .global_models
        .iter()
        .filter(|model| model.enabled)
        .collect();

    let body = match format.data_format() {
        prism_common::DataFormat::Claude => json!({
            "data": models
                .iter()
                .map(|model| json!({
                    "type": "model",
                    "id": model.name,
                    "display_name": model.display_name,
                }))
                .collect::<Vec<_>>(),
            "has_more": false,
        }),
        prism_common::DataFormat::Gemini => json!({
            "models": models
                .iter()
                .map(|model| json!({
                    "name": format!("models/{}", model.name),
                    "displayName": model.display_name,
                    "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
                }))
                .collect::<Vec<_>>(),
        }),
        _ => json!({
            "object": "list",
            "data": models
                .iter()
                .map(|model| json!({
                    "id": model.name,
                    "object": "model",
                    "owned_by": "prism",
                }))
                .collect::<Vec<_>>(),
        }),
    };

    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            axum::response::IntoResponse::into_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        })
}
