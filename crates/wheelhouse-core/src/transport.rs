//! Named-channel transport bus.
//!
//! In-process pub/sub over a tokio broadcast channel. Channels are addressed
//! by name, by convention `prefix:sessionId` (see [`ChannelKind`]). Payloads
//! stay as raw JSON text end to end so the dedup filter can compare the
//! unparsed bytes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bus capacity. Slow subscribers beyond this lag and miss events.
const DEFAULT_CAPACITY: usize = 1024;

/// The channel kinds a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Raw provider message stream.
    Message,
    /// Session identity updates, payload `{"old": ..., "new": ...}`.
    IdentityUpdate,
    /// Process completion signal, no payload. Signals abnormal end when no
    /// result preceded it.
    Completion,
}

impl ChannelKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ChannelKind::Message => "message",
            ChannelKind::IdentityUpdate => "identity-update",
            ChannelKind::Completion => "completion",
        }
    }

    /// Full channel name for a session, e.g. `message:sess-123`.
    pub fn channel_name(&self, session_id: &str) -> String {
        format!("{}:{}", self.prefix(), session_id)
    }

    /// Recover the kind from a full channel name.
    pub fn from_channel(channel: &str) -> Option<ChannelKind> {
        match channel.split(':').next() {
            Some("message") => Some(ChannelKind::Message),
            Some("identity-update") => Some(ChannelKind::IdentityUpdate),
            Some("completion") => Some(ChannelKind::Completion),
            _ => None,
        }
    }
}

/// A single event on the bus: a channel name plus raw payload text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    pub channel: String,
    pub payload: String,
}

impl TransportEvent {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Broadcast bus carrying [`TransportEvent`]s to any number of subscribers.
///
/// Subscribers receive all channels and filter by name; this keeps the bus
/// itself free of per-channel bookkeeping.
pub struct ChannelBus {
    sender: broadcast::Sender<TransportEvent>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a raw payload on a named channel.
    ///
    /// Returns the number of subscribers reached; an event with no
    /// subscribers is dropped.
    pub fn emit(&self, channel: &str, payload: &str) -> usize {
        let event = TransportEvent::new(channel, payload);
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to the bus. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}
