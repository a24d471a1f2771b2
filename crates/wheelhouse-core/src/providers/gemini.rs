//! Gemini wire vocabulary.
//!
//! Gemini emits flat NDJSON events with an `event` discriminator and a
//! role/content shape: streamed text as `content` events with a `delta`
//! field, tool calls with `name`/`parameters`, tool results keyed by
//! `tool_id` with an `output` field, and a `complete` event carrying
//! `prompt_tokens`/`response_tokens`/`cached_tokens` usage. Gemini never
//! surfaces reasoning, so no thinking messages exist for this provider.

use serde::Deserialize;

use super::WireEvent;
use crate::protocol::Usage;

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiStreamEvent {
    pub event: String,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub delta: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub tool_id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub parameters: Option<serde_json::Value>,

    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub is_error: Option<bool>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub usage: Option<GeminiUsage>,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub response_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

impl From<&GeminiUsage> for Usage {
    fn from(u: &GeminiUsage) -> Self {
        Usage {
            input: u.prompt_tokens,
            output: u.response_tokens,
            cache_read: u.cached_tokens,
            cache_creation: 0,
        }
    }
}

/// Lower one raw Gemini payload into wire events.
pub fn lower(raw: &str) -> Result<Vec<WireEvent>, serde_json::Error> {
    let event: GeminiStreamEvent = serde_json::from_str(raw)?;

    let lowered = match event.event.as_str() {
        "init" => vec![WireEvent::System {
            subtype: "init".to_string(),
            text: event.session_id.clone().unwrap_or_default(),
        }],

        "content" => {
            // Only assistant content reaches the UI; user echoes are
            // dropped here.
            if event.role.as_deref() != Some("assistant") {
                vec![WireEvent::Ignored]
            } else {
                match event.delta.clone() {
                    Some(text) => vec![WireEvent::TextDelta { text }],
                    None => vec![WireEvent::Ignored],
                }
            }
        }

        "tool" => vec![WireEvent::ToolInvocation {
            id: event.id.clone(),
            name: event.name.clone().unwrap_or_else(|| "unknown".to_string()),
            input: event.parameters.clone().unwrap_or(serde_json::json!({})),
        }],

        "tool_result" => vec![WireEvent::ToolResult {
            tool_use_id: event.tool_id.clone().unwrap_or_default(),
            content: event.output.clone().unwrap_or_default(),
            is_error: event.is_error.unwrap_or(false),
        }],

        "complete" => vec![WireEvent::TurnResult {
            subtype: "complete".to_string(),
            status: event.status.clone().unwrap_or_else(|| "success".to_string()),
            usage: event.usage.as_ref().map(Usage::from),
            model: event.model.clone(),
            cost: None,
            duration_ms: None,
            session_id: event.session_id.clone(),
        }],

        "error" => vec![WireEvent::System {
            subtype: "error".to_string(),
            text: event.message.clone().unwrap_or_default(),
        }],

        _ => vec![WireEvent::Ignored],
    };

    Ok(lowered)
}
