//! Claude wire vocabulary.
//!
//! Claude emits one JSON object per event. Assistant turns carry a
//! `message.content` array of blocks (`text`, `thinking`, `tool_use`),
//! streamed text arrives as `content_block_delta`, tool results come back
//! inside `user` messages, and a `result` event closes the turn with usage
//! counters and cost.

use serde::Deserialize;

use super::{TurnBlock, WireEvent};
use crate::protocol::Usage;

/// Top-level Claude stream event. Different event types populate different
/// optional fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeStreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub subtype: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub message: Option<ClaudeMessage>,

    #[serde(default)]
    pub content_block: Option<ContentBlock>,

    #[serde(default)]
    pub delta: Option<Delta>,

    #[serde(default)]
    pub usage: Option<ClaudeUsage>,

    #[serde(default)]
    pub is_error: Option<bool>,

    #[serde(default)]
    pub total_cost_usd: Option<f64>,

    #[serde(default)]
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub model: Option<String>,

    /// Per-model usage map; its first key doubles as the model identifier
    /// when the `model` field is absent.
    #[serde(default, rename = "modelUsage")]
    pub model_usage: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A content block. Only the fields for its `type` are populated.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub thinking: Option<String>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub input: Option<serde_json::Value>,

    // tool_result blocks
    #[serde(default)]
    pub tool_use_id: Option<String>,

    #[serde(default)]
    pub content: Option<serde_json::Value>,

    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl From<&ClaudeUsage> for Usage {
    fn from(u: &ClaudeUsage) -> Self {
        Usage {
            input: u.input_tokens,
            output: u.output_tokens,
            cache_read: u.cache_read_input_tokens,
            cache_creation: u.cache_creation_input_tokens,
        }
    }
}

/// Render a tool_result content value as display text. String content is
/// used verbatim; block arrays have their text parts joined.
fn content_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Lower one raw Claude payload into wire events.
pub fn lower(raw: &str) -> Result<Vec<WireEvent>, serde_json::Error> {
    let event: ClaudeStreamEvent = serde_json::from_str(raw)?;

    let lowered = match event.event_type.as_str() {
        "assistant" => {
            let blocks = event
                .message
                .as_ref()
                .map(|m| m.content.as_slice())
                .unwrap_or_default()
                .iter()
                .filter_map(|block| match block.block_type.as_str() {
                    "text" => Some(TurnBlock::Text(block.text.clone().unwrap_or_default())),
                    "thinking" => block.thinking.clone().map(TurnBlock::Thinking),
                    "tool_use" => Some(TurnBlock::ToolUse {
                        id: block.id.clone(),
                        name: block.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                        input: block.input.clone().unwrap_or(serde_json::json!({})),
                    }),
                    _ => None,
                })
                .collect();
            vec![WireEvent::AssistantTurn { blocks }]
        }

        // Tool results ride in on user messages.
        "user" => event
            .message
            .as_ref()
            .map(|m| m.content.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|block| block.block_type == "tool_result")
            .map(|block| WireEvent::ToolResult {
                tool_use_id: block.tool_use_id.clone().unwrap_or_default(),
                content: block
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default(),
                is_error: block.is_error.unwrap_or(false),
            })
            .collect(),

        "content_block_delta" => match event.delta.as_ref().and_then(|d| d.text.clone()) {
            Some(text) => vec![WireEvent::TextDelta { text }],
            None => vec![WireEvent::Ignored],
        },

        // A tool_use block starting mid-stream is a turn boundary even
        // before its input finishes streaming.
        "content_block_start" => match event.content_block.as_ref() {
            Some(block) if block.block_type == "tool_use" => vec![WireEvent::ToolInvocation {
                id: block.id.clone(),
                name: block.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                input: block.input.clone().unwrap_or(serde_json::json!({})),
            }],
            _ => vec![WireEvent::Ignored],
        },

        "system" => vec![WireEvent::System {
            subtype: event.subtype.clone().unwrap_or_default(),
            text: event.model.clone().unwrap_or_default(),
        }],

        "result" => {
            let usage = event.usage.as_ref().map(Usage::from);
            // Model comes from `model` when present, otherwise the first
            // key of the modelUsage map.
            let model = event.model.clone().or_else(|| {
                event
                    .model_usage
                    .as_ref()
                    .and_then(|m| m.keys().next().cloned())
            });
            let status = if event.is_error.unwrap_or(false) {
                "error".to_string()
            } else {
                "success".to_string()
            };
            vec![WireEvent::TurnResult {
                subtype: event.subtype.clone().unwrap_or_else(|| "success".to_string()),
                status,
                usage,
                model,
                cost: event.total_cost_usd,
                duration_ms: event.duration_ms,
                session_id: event.session_id.clone(),
            }]
        }

        _ => vec![WireEvent::Ignored],
    };

    Ok(lowered)
}
