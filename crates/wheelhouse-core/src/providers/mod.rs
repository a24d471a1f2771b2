//! Provider event normalization.
//!
//! Each provider speaks its own JSON vocabulary. A per-provider `lower`
//! function parses that vocabulary into the shared [`WireEvent`]
//! intermediate, so field-name differences (`name` vs `tool_name`, `input`
//! vs `parameters`, `id` vs `tool_id`) stay inside one module per provider
//! instead of leaking fallback chains into shared code.
//!
//! The [`Normalizer`] then turns `WireEvent`s into [`UnifiedMessage`]s,
//! holding the only mutable state in the pipeline: the streaming-text
//! accumulator for the current turn.

pub mod claude;
pub mod codex;
pub mod gemini;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{UnifiedMessage, Usage};

/// The providers this adapter can front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

/// A block inside a full assistant turn, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        id: Option<String>,
        name: String,
        input: serde_json::Value,
    },
}

/// Normalized intermediate between a provider's wire shapes and the unified
/// protocol. Every provider lowers into this; nothing provider-specific
/// survives past it.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// Incremental streaming text for the current turn.
    TextDelta { text: String },
    /// A complete assistant turn with its content blocks.
    AssistantTurn { blocks: Vec<TurnBlock> },
    /// A standalone tool invocation (providers that emit tool calls outside
    /// an assistant turn). A turn boundary for the text accumulator.
    ToolInvocation {
        id: Option<String>,
        name: String,
        input: serde_json::Value,
    },
    /// A tool execution result.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// Provider system/informational message.
    System { subtype: String, text: String },
    /// Usage counters surfaced mid-turn.
    Usage(Usage),
    /// The authoritative end of a turn.
    TurnResult {
        subtype: String,
        status: String,
        usage: Option<Usage>,
        model: Option<String>,
        cost: Option<f64>,
        duration_ms: Option<u64>,
        session_id: Option<String>,
    },
    /// The turn was aborted by the user.
    Interrupted,
    /// A wire event with no unified counterpart. Dropped silently.
    Ignored,
}

/// In-flight streaming text for one turn.
#[derive(Debug)]
struct StreamState {
    /// Stable id every re-emission carries, so the UI replaces by id.
    id: String,
    text: String,
}

/// Per-session normalizer.
///
/// Stateless except for the streaming accumulator and the flag tracking
/// whether a turn is open (needed for the abnormal-termination fallback).
#[derive(Debug)]
pub struct Normalizer {
    provider: Provider,
    stream: Option<StreamState>,
    turn_open: bool,
}

impl Normalizer {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            stream: None,
            turn_open: false,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Normalize one raw payload into zero or more unified messages.
    ///
    /// Never fails: an unparseable payload lowers to a single `Error`
    /// message and the session continues.
    pub fn normalize(&mut self, raw: &str) -> Vec<UnifiedMessage> {
        let lowered = match self.provider {
            Provider::Claude => claude::lower(raw),
            Provider::Codex => codex::lower(raw),
            Provider::Gemini => gemini::lower(raw),
        };

        let events = match lowered {
            Ok(events) => events,
            Err(err) => {
                log::warn!("unparseable {:?} payload: {}", self.provider, err);
                return vec![UnifiedMessage::Error {
                    message: format!("failed to parse provider payload: {err}"),
                }];
            }
        };

        let mut messages = Vec::new();
        for event in events {
            messages.extend(self.apply(event));
        }
        messages
    }

    /// Handle the completion signal for the session's process.
    ///
    /// When the process ends without a prior result (crash, early exit) the
    /// UI must still see exactly one `StreamingEnd`, or it is stuck showing
    /// a typing indicator forever.
    pub fn on_completion(&mut self) -> Vec<UnifiedMessage> {
        if self.turn_open {
            self.stream = None;
            self.turn_open = false;
            vec![UnifiedMessage::StreamingEnd]
        } else {
            Vec::new()
        }
    }

    fn apply(&mut self, event: WireEvent) -> Vec<UnifiedMessage> {
        match event {
            WireEvent::TextDelta { text } => {
                self.turn_open = true;
                let stream = self.stream.get_or_insert_with(|| StreamState {
                    id: Uuid::new_v4().to_string(),
                    text: String::new(),
                });
                stream.text.push_str(&text);
                // Re-emit the full accumulated text, not a patch. A UI that
                // replaces by id cannot misorder full snapshots.
                vec![UnifiedMessage::AssistantText {
                    streaming: true,
                    id: stream.id.clone(),
                    content: stream.text.clone(),
                }]
            }

            WireEvent::AssistantTurn { blocks } => {
                self.turn_open = true;
                let mut tools = Vec::new();
                let mut thinking = Vec::new();
                let mut text = String::new();

                for block in blocks {
                    match block {
                        TurnBlock::ToolUse { id, name, input } => {
                            tools.push(UnifiedMessage::ToolUse {
                                id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                                name,
                                input,
                            });
                        }
                        TurnBlock::Thinking(t) => {
                            thinking.push(UnifiedMessage::Thinking {
                                is_thinking: true,
                                text: t,
                            });
                        }
                        TurnBlock::Text(t) => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&t);
                        }
                    }
                }

                if !tools.is_empty() {
                    // Tool invocation starts a new turn segment.
                    self.stream = None;
                }

                // The final text replaces the streaming message when one is
                // open, so it reuses the stream id.
                let id = match self.stream.take() {
                    Some(stream) => stream.id,
                    None => Uuid::new_v4().to_string(),
                };

                // Tool-use first so the UI renders tool activity without
                // waiting for the rest of the turn. The text message is
                // always emitted, even empty: dropping it would break
                // turn-taking continuity in conversation history.
                let mut messages = thinking;
                messages.extend(tools);
                messages.push(UnifiedMessage::AssistantText {
                    streaming: false,
                    id,
                    content: text,
                });
                messages
            }

            WireEvent::ToolInvocation { id, name, input } => {
                self.turn_open = true;
                // Tool invocation start is a turn boundary.
                self.stream = None;
                vec![UnifiedMessage::ToolUse {
                    id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    name,
                    input,
                }]
            }

            WireEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                self.turn_open = true;
                vec![UnifiedMessage::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                }]
            }

            WireEvent::System { subtype, text } => {
                vec![UnifiedMessage::System { subtype, text }]
            }

            WireEvent::Usage(usage) => {
                self.turn_open = true;
                vec![UnifiedMessage::Usage { usage }]
            }

            WireEvent::TurnResult {
                subtype,
                status,
                usage,
                model,
                cost,
                duration_ms,
                session_id,
            } => {
                // The result is the single point at which streaming state is
                // cleared; StreamingEnd goes out first so a UI clearing its
                // typing indicator never races the final content.
                self.stream = None;
                self.turn_open = false;
                vec![
                    UnifiedMessage::StreamingEnd,
                    UnifiedMessage::Result {
                        subtype,
                        status,
                        usage,
                        model,
                        cost,
                        duration_ms,
                        raw_session_id: session_id,
                    },
                ]
            }

            WireEvent::Interrupted => {
                self.stream = None;
                self.turn_open = false;
                vec![UnifiedMessage::Interrupt, UnifiedMessage::StreamingEnd]
            }

            WireEvent::Ignored => Vec::new(),
        }
    }
}
