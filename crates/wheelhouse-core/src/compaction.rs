//! Compaction trigger state machine.
//!
//! Turns the ledger's window percentage into staged actions: warn the UI,
//! schedule an auto-compaction, or force one. Scheduled compactions never
//! fire immediately; they wait for the next user-submitted message, send a
//! synthetic `/compact` instruction first, and hold the user's own message
//! until the compaction is detected as complete.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::CompactionConfig;
use crate::ledger::TokenLedgerEntry;

/// Recent-activity lines kept per session for manifest extraction.
const ACTIVITY_CAPACITY: usize = 30;

/// What the trigger decided for one ledger update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionAction {
    None,
    /// Surface a warning to the UI; re-evaluated every update.
    Warning,
    /// Schedule compaction for the next user turn.
    AutoTrigger,
    /// Same deferred mechanism, but not skippable by disabling auto-compact.
    Force,
}

impl CompactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionAction::None => "none",
            CompactionAction::Warning => "warning",
            CompactionAction::AutoTrigger => "auto",
            CompactionAction::Force => "force",
        }
    }
}

/// Per-session trigger state.
#[derive(Debug, Default)]
pub struct CompactionState {
    pub pending_auto_compact: bool,
    pub is_compacting: bool,
    last_compaction: Option<Instant>,
    pub manifest_saved: bool,
    /// User message held back while a compaction is in flight.
    deferred_user_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest directory configured")]
    NoDirectory,
    #[error("failed to write manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lightweight record of what the conversation was about, persisted before
/// the compact instruction goes out so the post-compaction context can be
/// reconstructed.
#[derive(Debug, Clone, Serialize)]
pub struct ContextManifest {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub usage_percentage: f64,
    pub files_touched: Vec<String>,
    pub decisions: Vec<String>,
}

impl ContextManifest {
    /// Short natural-language hint appended to the compact instruction.
    pub fn hint(&self) -> String {
        let mut parts = Vec::new();
        if !self.files_touched.is_empty() {
            parts.push(format!("Files in progress: {}.", self.files_touched.join(", ")));
        }
        if !self.decisions.is_empty() {
            parts.push(format!("Recent decisions: {}", self.decisions.join("; ")));
        }
        parts.join(" ")
    }
}

/// The compaction trigger for all sessions.
pub struct CompactionTrigger {
    config: CompactionConfig,
    states: HashMap<String, CompactionState>,
    /// Recent tool inputs and assistant text per session, manifest fodder.
    activity: HashMap<String, VecDeque<String>>,
    file_pattern: Regex,
}

impl CompactionTrigger {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            activity: HashMap::new(),
            // Path-looking tokens with an extension, e.g. src/ledger.rs.
            file_pattern: Regex::new(r"[\w./-]*[\w-]+\.[A-Za-z]{1,8}\b")
                .unwrap_or_else(|e| unreachable!("static regex: {e}")),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn state(&self, session_id: &str) -> Option<&CompactionState> {
        self.states.get(session_id)
    }

    fn state_mut(&mut self, session_id: &str) -> &mut CompactionState {
        self.states.entry(session_id.to_string()).or_default()
    }

    /// Record conversation material for manifest extraction.
    pub fn note_activity(&mut self, session_id: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let lines = self.activity.entry(session_id.to_string()).or_default();
        lines.push_back(line.to_string());
        while lines.len() > ACTIVITY_CAPACITY {
            lines.pop_front();
        }
    }

    /// Decide the staged action for the current ledger entry.
    ///
    /// All guards are independent of the thresholds: an in-flight or already
    /// scheduled compaction, too few messages, a total below the plausibility
    /// floor, the rolling rate limit, and percentages too absurd to act on.
    pub fn evaluate(
        &mut self,
        session_id: &str,
        entry: &TokenLedgerEntry,
        percentage: f64,
        window_ceiling: u64,
    ) -> CompactionAction {
        if !self.config.is_valid() {
            log::warn!("compaction thresholds misconfigured; trigger disabled");
            return CompactionAction::None;
        }
        if percentage > self.config.sanity_ceiling {
            log::warn!(
                "ignoring implausible usage percentage {:.0}% for {}",
                percentage * 100.0,
                session_id
            );
            return CompactionAction::None;
        }
        if percentage < self.config.warn_threshold {
            return CompactionAction::None;
        }

        let min_total = (window_ceiling as f64 * self.config.min_total_fraction) as u64;
        let min_messages = self.config.min_messages;
        let rate_limit = self.config.rate_limit;
        let state = self.state_mut(session_id);

        if state.is_compacting || state.pending_auto_compact {
            return CompactionAction::None;
        }
        if entry.message_count < min_messages {
            return CompactionAction::None;
        }
        if entry.total_tokens < min_total {
            return CompactionAction::None;
        }
        if let Some(last) = state.last_compaction {
            if last.elapsed() < rate_limit {
                return CompactionAction::None;
            }
        }

        if percentage >= self.config.force_threshold {
            CompactionAction::Force
        } else if percentage >= self.config.auto_threshold {
            if self.config.auto_compact_enabled && !entry.auto_compact_triggered {
                CompactionAction::AutoTrigger
            } else {
                CompactionAction::Warning
            }
        } else {
            CompactionAction::Warning
        }
    }

    /// Mark a compaction as scheduled; it fires on the next user message.
    pub fn schedule(&mut self, session_id: &str) {
        let state = self.state_mut(session_id);
        state.pending_auto_compact = true;
        state.manifest_saved = false;
    }

    /// Intercept a user-submitted message.
    ///
    /// With a compaction pending this returns the `/compact` instruction to
    /// send instead, holds the user's message for later release, and marks
    /// the session as compacting. Otherwise the message passes through.
    pub fn on_user_message(&mut self, session_id: &str, text: &str, percentage: f64) -> UserTurn {
        let pending = self
            .states
            .get(session_id)
            .map(|s| s.pending_auto_compact && !s.is_compacting)
            .unwrap_or(false);
        if !pending {
            return UserTurn::Forward;
        }

        let manifest = self.build_manifest(session_id, percentage);
        let saved = match self.persist_manifest(&manifest) {
            Ok(path) => {
                log::info!("context manifest saved to {}", path.display());
                true
            }
            Err(ManifestError::NoDirectory) => false,
            Err(err) => {
                // Best-effort only; never blocks the compact instruction.
                log::warn!("failed to persist context manifest: {}", err);
                false
            }
        };

        let hint = manifest.hint();
        let instruction = if hint.is_empty() {
            "/compact".to_string()
        } else {
            format!("/compact {hint}")
        };

        let state = self.state_mut(session_id);
        state.pending_auto_compact = false;
        state.is_compacting = true;
        state.last_compaction = Some(Instant::now());
        state.manifest_saved = saved;
        state.deferred_user_message = Some(text.to_string());

        UserTurn::CompactFirst { instruction }
    }

    /// Roll back a compact instruction that failed to send, so the session
    /// is not stuck compacting and the user's message is not lost.
    pub fn rollback_send(&mut self, session_id: &str) -> Option<String> {
        let state = self.state_mut(session_id);
        state.is_compacting = false;
        state.pending_auto_compact = false;
        state.deferred_user_message.take()
    }

    /// The external compaction completed: clear flags and release the held
    /// user message, if any.
    pub fn on_compaction_complete(&mut self, session_id: &str) -> Option<String> {
        let state = self.state_mut(session_id);
        state.is_compacting = false;
        state.pending_auto_compact = false;
        state.deferred_user_message.take()
    }

    /// Drop per-session state. Called on close.
    pub fn forget_session(&mut self, session_id: &str) {
        self.states.remove(session_id);
        self.activity.remove(session_id);
    }

    fn build_manifest(&self, session_id: &str, percentage: f64) -> ContextManifest {
        let empty = VecDeque::new();
        let lines = self.activity.get(session_id).unwrap_or(&empty);

        let mut files = Vec::new();
        for line in lines {
            for m in self.file_pattern.find_iter(line) {
                let path = m.as_str().to_string();
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        files.truncate(10);

        // The most recent activity lines double as the decision trail.
        let decisions: Vec<String> = lines
            .iter()
            .rev()
            .take(5)
            .map(|l| l.lines().next().unwrap_or_default().to_string())
            .collect();

        ContextManifest {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            usage_percentage: percentage,
            files_touched: files,
            decisions,
        }
    }

    fn persist_manifest(&self, manifest: &ContextManifest) -> Result<PathBuf, ManifestError> {
        let dir = self
            .config
            .manifest_dir
            .as_ref()
            .ok_or(ManifestError::NoDirectory)?;
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}-{}.json",
            manifest.session_id,
            manifest.created_at.timestamp_millis()
        ));
        fs::write(&path, serde_json::to_vec_pretty(manifest)?)?;
        Ok(path)
    }
}

/// What to do with a user-submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserTurn {
    /// No compaction pending; forward the message as-is.
    Forward,
    /// Send this compact instruction now; the user message is held until
    /// the compaction completes.
    CompactFirst { instruction: String },
}
