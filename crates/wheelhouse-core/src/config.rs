//! Adapter configuration.
//!
//! Compaction thresholds have changed across revisions of the agents this
//! adapter fronts, so none of them are hard-coded: everything that gates
//! warning/compaction behavior is a field here with a default.

use std::path::PathBuf;
use std::time::Duration;

/// Thresholds and guards for the compaction trigger.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Fraction of the window at which the UI is warned.
    pub warn_threshold: f64,
    /// Fraction at which auto-compaction is scheduled for the next user turn.
    pub auto_threshold: f64,
    /// Fraction at which compaction is forced even with auto-compact disabled.
    pub force_threshold: f64,
    /// When false, the auto threshold is ignored. Force still applies.
    pub auto_compact_enabled: bool,
    /// Minimum messages seen before any trigger may fire.
    pub min_messages: u64,
    /// Minimum fraction of the window that must be measured before a trigger
    /// may fire. Guards against miscomputed percentages.
    pub min_total_fraction: f64,
    /// Percentages above this are treated as a computation error and ignored.
    pub sanity_ceiling: f64,
    /// At most one compaction per session within this window.
    pub rate_limit: Duration,
    /// Directory for context manifests. None disables manifest persistence.
    pub manifest_dir: Option<PathBuf>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.55,
            auto_threshold: 0.60,
            force_threshold: 0.65,
            auto_compact_enabled: true,
            min_messages: 3,
            min_total_fraction: 0.25,
            sanity_ceiling: 2.0,
            rate_limit: Duration::from_secs(60),
            manifest_dir: None,
        }
    }
}

impl CompactionConfig {
    /// Check `0 < warn < auto < force < 1`.
    pub fn is_valid(&self) -> bool {
        0.0 < self.warn_threshold
            && self.warn_threshold < self.auto_threshold
            && self.auto_threshold < self.force_threshold
            && self.force_threshold < 1.0
    }
}

/// Top-level configuration for a [`SessionAdapter`](crate::adapter::SessionAdapter).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Context-window ceiling in tokens, the denominator for percentages.
    pub window_ceiling: u64,
    /// Per-session cap on remembered raw payloads for deduplication.
    pub dedup_capacity: usize,
    /// Directory for per-session raw payload logs. None disables them.
    pub log_dir: Option<String>,
    pub compaction: CompactionConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            window_ceiling: 200_000,
            dedup_capacity: 1000,
            log_dir: None,
            compaction: CompactionConfig::default(),
        }
    }
}
