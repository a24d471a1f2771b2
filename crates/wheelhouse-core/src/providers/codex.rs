//! Codex wire vocabulary.
//!
//! Codex speaks JSON-RPC-style notifications: a `method` string plus a
//! `params` object. Tool calls use `tool_name`/`parameters`/`tool_id` where
//! Claude uses `name`/`input`/`id`, tool output uses `output` plus a
//! `status` string instead of `content`/`is_error`, and reasoning is never
//! surfaced. Token usage arrives as a separate mid-turn notification.

use serde::Deserialize;

use super::{TurnBlock, WireEvent};
use crate::protocol::Usage;

/// A Codex notification: method plus params.
#[derive(Debug, Clone, Deserialize)]
pub struct CodexNotification {
    pub method: String,
    #[serde(default)]
    pub params: CodexParams,
}

/// Union of the params fields used across methods. Each method reads only
/// its own fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexParams {
    #[serde(default)]
    pub delta: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub tool_id: Option<String>,

    #[serde(default)]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub parameters: Option<serde_json::Value>,

    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    /// Snapshot of reused context, not a per-turn delta.
    #[serde(default)]
    pub cached_input_tokens: u64,

    #[serde(default)]
    pub usage: Option<CodexUsage>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub thread_id: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl From<&CodexUsage> for Usage {
    fn from(u: &CodexUsage) -> Self {
        Usage {
            input: u.input_tokens,
            output: u.output_tokens,
            cache_read: u.cached_input_tokens,
            cache_creation: 0,
        }
    }
}

/// Lower one raw Codex payload into wire events.
pub fn lower(raw: &str) -> Result<Vec<WireEvent>, serde_json::Error> {
    let event: CodexNotification = serde_json::from_str(raw)?;
    let params = &event.params;

    let lowered = match event.method.as_str() {
        "item/agentMessage/delta" => match params.delta.clone() {
            Some(text) => vec![WireEvent::TextDelta { text }],
            None => vec![WireEvent::Ignored],
        },

        // Complete assistant message for the turn.
        "item/agentMessage" => vec![WireEvent::AssistantTurn {
            blocks: vec![TurnBlock::Text(params.text.clone().unwrap_or_default())],
        }],

        "item/toolCall" => vec![WireEvent::ToolInvocation {
            id: params.tool_id.clone(),
            name: params
                .tool_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            input: params.parameters.clone().unwrap_or(serde_json::json!({})),
        }],

        "item/toolCall/output" => vec![WireEvent::ToolResult {
            tool_use_id: params.tool_id.clone().unwrap_or_default(),
            content: params.output.clone().unwrap_or_default(),
            is_error: params.status.as_deref() == Some("error"),
        }],

        "thread/tokenUsage/updated" => vec![WireEvent::Usage(Usage {
            input: params.input_tokens,
            output: params.output_tokens,
            cache_read: params.cached_input_tokens,
            cache_creation: 0,
        })],

        "turn/completed" => {
            let status = params
                .status
                .clone()
                .unwrap_or_else(|| "success".to_string());
            vec![WireEvent::TurnResult {
                subtype: "turn_completed".to_string(),
                status,
                usage: params.usage.as_ref().map(Usage::from),
                model: params.model.clone(),
                cost: None,
                duration_ms: params.duration_ms,
                session_id: params.thread_id.clone(),
            }]
        }

        "turn/aborted" => vec![WireEvent::Interrupted],

        "thread/started" => vec![WireEvent::System {
            subtype: "thread_started".to_string(),
            text: params.thread_id.clone().unwrap_or_default(),
        }],

        "error" => vec![WireEvent::System {
            subtype: "error".to_string(),
            text: params.message.clone().unwrap_or_default(),
        }],

        _ => vec![WireEvent::Ignored],
    };

    Ok(lowered)
}
