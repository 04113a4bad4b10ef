use prism_protocol::JsonValue;

use crate::internal::{InternalError, StopReason, UsageInfo};

/// Canonical streaming event sequence every dialect is mapped onto.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalStreamEvent {
    MessageStart {
        message_id: String,
        model: String,
        usage: Option<UsageInfo>,
    },
    ContentBlockStart {
        index: u32,
        kind: BlockKind,
        tool_id: Option<String>,
        tool_name: Option<String>,
    },
    ContentDelta {
        index: u32,
        text: String,
    },
    /// JSON string fragment of a tool call's input.
    ToolCallDelta {
        index: u32,
        tool_id: String,
        input_delta: String,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageStop {
        stop_reason: Option<StopReason>,
        usage: Option<UsageInfo>,
    },
    Usage {
        usage: UsageInfo,
    },
    Error {
        error: InternalError,
    },
    Unknown {
        raw_type: String,
        payload: JsonValue,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}
