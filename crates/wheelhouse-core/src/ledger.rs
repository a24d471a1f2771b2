//! Per-session token accounting.
//!
//! The ledger turns raw usage counters into a context-window percentage the
//! compaction trigger can act on. Totals are recomputed from scratch on
//! every update, never incremented in place: `cache_read` is a snapshot of
//! reused context, so summing it across turns would drift upward without
//! bound.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::Usage;

/// Running account of one session's token usage.
#[derive(Debug, Clone, Serialize)]
pub struct TokenLedgerEntry {
    pub session_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    /// Always `cache_read + input + output`, recomputed each update.
    pub total_tokens: u64,
    pub message_count: u64,
    pub compact_count: u64,
    pub tokens_saved: u64,
    pub auto_compact_triggered: bool,
    pub last_update: DateTime<Utc>,
}

impl TokenLedgerEntry {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_tokens: 0,
            message_count: 0,
            compact_count: 0,
            tokens_saved: 0,
            auto_compact_triggered: false,
            last_update: Utc::now(),
        }
    }

    fn recompute_total(&mut self) {
        self.total_tokens = self.cache_read_tokens + self.input_tokens + self.output_tokens;
    }
}

/// All session ledgers, keyed by canonical session handle.
///
/// Entries are created lazily on first usage, merged into the real handle's
/// entry when a temporary handle resolves, and deleted on close.
#[derive(Debug, Default)]
pub struct TokenLedger {
    entries: HashMap<String, TokenLedgerEntry>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<&TokenLedgerEntry> {
        self.entries.get(session_id)
    }

    /// Apply one turn's usage counters.
    ///
    /// `input`/`output` are new tokens for the turn and accumulate;
    /// `cache_creation` is a one-time cost per write and accumulates;
    /// `cache_read` is the current size of reused context and replaces the
    /// previous value.
    pub fn apply_usage(&mut self, session_id: &str, usage: &Usage) -> &TokenLedgerEntry {
        let entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| TokenLedgerEntry::new(session_id));

        entry.input_tokens += usage.input;
        entry.output_tokens += usage.output;
        entry.cache_creation_tokens += usage.cache_creation;
        entry.cache_read_tokens = usage.cache_read;
        entry.recompute_total();
        entry.message_count += 1;
        entry.last_update = Utc::now();
        entry
    }

    /// Apply a server-computed total directly, skipping local recomputation
    /// for this update so the two accountings are never double-counted.
    pub fn apply_server_total(&mut self, session_id: &str, total_tokens: u64) -> &TokenLedgerEntry {
        let entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| TokenLedgerEntry::new(session_id));

        entry.total_tokens = total_tokens;
        entry.message_count += 1;
        entry.last_update = Utc::now();
        entry
    }

    /// Fraction of the window consumed, or 0 for an unknown session.
    pub fn percentage(&self, session_id: &str, window_ceiling: u64) -> f64 {
        if window_ceiling == 0 {
            return 0.0;
        }
        self.entries
            .get(session_id)
            .map(|e| e.total_tokens as f64 / window_ceiling as f64)
            .unwrap_or(0.0)
    }

    /// Does this turn result look like a completed compaction?
    ///
    /// A result reporting zero usage tokens always counts. The weaker signal
    /// (output with no reused context) is only honored while a compact
    /// instruction is actually in flight; a provider that never reports
    /// cache usage emits that exact shape on every ordinary turn, and acting
    /// on it would wipe the ledger mid-conversation.
    pub fn looks_like_compaction(
        &self,
        session_id: &str,
        usage: &Usage,
        compaction_in_flight: bool,
    ) -> bool {
        let Some(entry) = self.entries.get(session_id) else {
            return false;
        };
        if entry.total_tokens == 0 {
            return false;
        }
        if usage.is_zero() {
            return true;
        }
        compaction_in_flight && usage.cache_read == 0 && usage.input == 0 && usage.output > 0
    }

    /// Record a completed compaction: counters reset, savings credited, and
    /// the auto-compact latch cleared so the threshold can fire again.
    pub fn record_compaction(&mut self, session_id: &str) -> Option<&TokenLedgerEntry> {
        let entry = self.entries.get_mut(session_id)?;
        entry.tokens_saved += entry.total_tokens;
        entry.input_tokens = 0;
        entry.output_tokens = 0;
        entry.cache_creation_tokens = 0;
        entry.cache_read_tokens = 0;
        entry.recompute_total();
        entry.compact_count += 1;
        entry.auto_compact_triggered = false;
        entry.last_update = Utc::now();
        log::info!(
            "compaction recorded for {}: {} total compactions, {} tokens saved",
            session_id,
            entry.compact_count,
            entry.tokens_saved
        );
        Some(entry)
    }

    /// Latch that an auto-compaction has been scheduled for this session.
    pub fn mark_auto_compact_triggered(&mut self, session_id: &str) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.auto_compact_triggered = true;
        }
    }

    /// Merge the entry under a superseded handle into the real handle's
    /// entry. Token counters merge with max (they are snapshots of the same
    /// conversation, not independent contributions); message counts sum.
    pub fn merge(&mut self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        let Some(old) = self.entries.remove(old_id) else {
            return;
        };
        let entry = self
            .entries
            .entry(new_id.to_string())
            .or_insert_with(|| TokenLedgerEntry::new(new_id));

        entry.input_tokens = entry.input_tokens.max(old.input_tokens);
        entry.output_tokens = entry.output_tokens.max(old.output_tokens);
        entry.cache_creation_tokens = entry.cache_creation_tokens.max(old.cache_creation_tokens);
        entry.cache_read_tokens = entry.cache_read_tokens.max(old.cache_read_tokens);
        entry.message_count += old.message_count;
        entry.compact_count = entry.compact_count.max(old.compact_count);
        entry.tokens_saved = entry.tokens_saved.max(old.tokens_saved);
        entry.auto_compact_triggered = entry.auto_compact_triggered || old.auto_compact_triggered;
        entry.recompute_total();
        entry.last_update = Utc::now();
    }

    /// Delete a session's entry. Called on close or explicit clear.
    pub fn remove(&mut self, session_id: &str) -> Option<TokenLedgerEntry> {
        self.entries.remove(session_id)
    }
}
