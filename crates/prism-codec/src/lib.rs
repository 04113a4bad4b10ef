mod compatibility;
mod error;
mod internal;
mod normalizers;
mod registry;
mod stream_events;
mod stream_state;

#[cfg(test)]
mod tests;

pub use compatibility::{FormatAcceptance, FormatCompatibility, check_format_compatibility};
pub use error::ConvertError;
pub use internal::{
    ContentBlock, ErrorKind, InstructionSegment, InternalError, InternalMessage, InternalRequest,
    InternalResponse, Role, StopReason, ToolChoice, ToolSpec, UsageInfo,
};
pub use registry::{
    Normalizer, StreamConverter, convert_error_body, convert_request, convert_response,
    normalizer, peek_embedded_error, stream_media_type,
};
pub use stream_events::InternalStreamEvent;
pub use stream_state::StreamState;
