//! Unified message protocol consumed by the UI.
//!
//! Every provider wire format is lowered into `UnifiedMessage`. This is the
//! stable contract the frontend depends on: it never sees provider-specific
//! shapes, only this tagged union.

use serde::{Deserialize, Serialize};

/// Token usage counters as surfaced by a provider.
///
/// `input`/`output` are new tokens for the turn. `cache_read` is a snapshot
/// of reused context (the current size, not a delta). `cache_creation` is a
/// one-time cost per cache write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_creation: u64,
}

impl Usage {
    /// True when the provider reported no tokens at all for this turn.
    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache_read == 0 && self.cache_creation == 0
    }
}

/// Unified message emitted by the adapter, tagged by kind.
///
/// Exactly one kind is populated per instance. Providers that hide a
/// capability (e.g. reasoning) simply never emit that kind; the UI must not
/// assume every turn carries every kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UnifiedMessage {
    /// Assistant text. While streaming, each update re-emits the full
    /// accumulated text so far under a stable `id` so the UI can replace
    /// by id without ordering bugs.
    AssistantText {
        streaming: bool,
        id: String,
        content: String,
    },

    /// A tool invocation extracted from an assistant turn.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Result of a tool execution.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Reasoning content, for providers that expose it.
    Thinking { is_thinking: bool, text: String },

    /// Provider system/informational message.
    System { subtype: String, text: String },

    /// Raw usage counters surfaced mid-turn.
    Usage { usage: Usage },

    /// Authoritative end of a turn. Always preceded by `StreamingEnd`
    /// for the same turn.
    Result {
        subtype: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_session_id: Option<String>,
    },

    /// A failure surfaced to the UI (transport, parse, or send).
    Error { message: String },

    /// The user interrupted the turn.
    Interrupt,

    /// Streaming state for the session is cleared. Emitted before every
    /// `Result`, and on abnormal process end with no result at all.
    StreamingEnd,
}

impl UnifiedMessage {
    /// Usage counters carried by this message, if any.
    pub fn usage(&self) -> Option<&Usage> {
        match self {
            UnifiedMessage::Usage { usage } => Some(usage),
            UnifiedMessage::Result {
                usage: Some(usage), ..
            } => Some(usage),
            _ => None,
        }
    }
}
