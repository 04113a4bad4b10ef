mod format;
mod headers;

pub use format::{
    ApiFormat, AuthStyle, DataFormat, FormatDefinition, format_definition, is_passthrough,
    resolve_api_format,
};
pub use headers::{
    Headers, header_get, header_remove, header_set, strip_hop_by_hop,
};

/// Row ids follow the storage layer (signed 64-bit, assigned by the DB).
pub type ProviderId = i64;
pub type EndpointId = i64;
pub type KeyId = i64;
pub type GlobalModelId = i64;
pub type UserId = i64;
pub type ApiKeyId = i64;

/// Per-dispatch correlation id, carried in logs and telemetry rows.
pub fn new_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Masked form of an upstream credential id for logs.
pub fn mask_key_id(id: KeyId) -> String {
    format!("key#{id}")
}
