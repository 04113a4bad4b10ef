pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

use std::collections::BTreeMap;

pub type JsonValue = serde_json::Value;
pub type JsonObject = BTreeMap<String, JsonValue>;
