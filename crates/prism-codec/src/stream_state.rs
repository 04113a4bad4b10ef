use std::collections::HashMap;

use crate::internal::{StopReason, UsageInfo};
use crate::stream_events::BlockKind;

/// Cross-chunk conversion state for one streamed request.
///
/// Each normalizer reads and writes only its own substate; the shared
/// `model`/`message_id` pair is assigned by whichever side sees them first.
#[derive(Debug, Default)]
pub struct StreamState {
    pub model: String,
    pub message_id: String,
    pub claude: ClaudeSubstate,
    pub openai_chat: OpenAiChatSubstate,
    pub openai_responses: OpenAiResponsesSubstate,
    pub gemini: GeminiSubstate,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset between attempts; stream state never crosses candidates.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
pub struct ClaudeSubstate {
    // Incoming side.
    /// Tool ids by block index, for `input_json_delta`.
    pub tool_ids: HashMap<u32, String>,
    /// `message_delta` carries stop reason and usage; `message_stop` carries
    /// nothing, so both are held until the stop event.
    pub pending_stop: Option<StopReason>,
    pub usage_acc: UsageInfo,
    // Outgoing side.
    pub started: bool,
    pub open_blocks: HashMap<u32, BlockKind>,
    pub final_usage: UsageInfo,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct OpenAiChatSubstate {
    // Incoming side.
    pub started: bool,
    pub stopped: bool,
    pub text_block_index: Option<u32>,
    pub next_block_index: u32,
    /// OpenAI tool_calls index -> (internal block index, tool id).
    pub tool_blocks: HashMap<u32, (u32, String)>,
    /// finish_reason arrives before the trailing usage chunk; hold the stop
    /// until usage is known or the stream ends.
    pub pending_stop: Option<StopReason>,
    pub pending_usage: Option<UsageInfo>,
    // Outgoing side.
    pub out_started: bool,
    pub out_id: String,
    pub out_created: i64,
    /// Internal block index -> openai tool_calls index.
    pub out_tool_indexes: HashMap<u32, u32>,
    pub out_usage: UsageInfo,
    pub out_finished: bool,
    pub out_done_emitted: bool,
}

#[derive(Debug, Default)]
pub struct OpenAiResponsesSubstate {
    // Incoming side.
    pub started: bool,
    /// output_index -> (internal block index, kind, tool id).
    pub items: HashMap<u32, (u32, BlockKind, Option<String>)>,
    pub next_block_index: u32,
    // Outgoing side.
    pub out_started: bool,
    pub out_id: String,
    pub out_items: Vec<OutItemAccum>,
    /// Internal block index -> position in `out_items` (the output_index).
    pub out_index_map: HashMap<u32, u32>,
    pub out_usage: UsageInfo,
    pub out_finished: bool,
}

/// Accumulated output item, used to assemble `response.completed`.
#[derive(Debug, Clone)]
pub struct OutItemAccum {
    pub kind: BlockKind,
    pub item_id: String,
    pub call_id: Option<String>,
    pub tool_name: Option<String>,
    pub buffer: String,
    pub done: bool,
}

#[derive(Debug, Default)]
pub struct GeminiSubstate {
    // Incoming side.
    pub started: bool,
    pub text_block_index: Option<u32>,
    pub next_block_index: u32,
    pub tool_count: u32,
    pub finished: bool,
    // Outgoing side: function calls are re-assembled whole because the
    // wire has no partial-call framing.
    pub out_tools: HashMap<u32, (String, String)>,
    pub out_usage: UsageInfo,
    pub out_finished: bool,
}
