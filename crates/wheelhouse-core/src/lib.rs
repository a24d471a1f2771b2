//! Framework-agnostic core for a desktop client driving AI coding-agent
//! sessions.
//!
//! Raw provider output arrives on named transport channels, gets
//! deduplicated and normalized into a unified message protocol, and feeds
//! token accounting that decides when a session's context should be
//! compacted. Nothing in here knows about a UI framework or a concrete
//! process layer; both plug in through the [`adapter::MessageSink`] and
//! [`adapter::Orchestrator`] traits.

pub mod adapter;
pub mod compaction;
pub mod config;
pub mod dedup;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod transport;

pub use adapter::{AdapterError, HookSink, MessageSink, Orchestrator, SessionAdapter};
pub use compaction::{CompactionAction, CompactionTrigger};
pub use config::{AdapterConfig, CompactionConfig};
pub use ledger::{TokenLedger, TokenLedgerEntry};
pub use protocol::{UnifiedMessage, Usage};
pub use providers::{Normalizer, Provider};
pub use transport::{ChannelBus, ChannelKind, TransportEvent};
