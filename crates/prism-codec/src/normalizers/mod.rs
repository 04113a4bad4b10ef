pub mod claude;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;

use prism_protocol::JsonValue;

pub(crate) fn raw_type_of(value: &JsonValue) -> String {
    value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string()
}
