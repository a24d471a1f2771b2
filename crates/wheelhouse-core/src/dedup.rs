//! Per-session deduplication of raw payloads.
//!
//! During a channel migration the old and new message channels briefly
//! overlap, and some providers re-emit on the original channel for later
//! turns. Either way the identical raw payload can arrive twice; this filter
//! drops the second delivery.
//!
//! Equality is exact equality of the raw, unparsed payload text. The
//! normalized message cannot be compared instead because normalization is
//! lossy and id-generating.

use std::collections::{HashMap, HashSet, VecDeque};

/// Bounded memory of recently seen payloads for one session.
#[derive(Debug, Default)]
struct SeenSet {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn remember(&mut self, payload: &str, capacity: usize) {
        if self.set.contains(payload) {
            return;
        }
        self.set.insert(payload.to_string());
        self.order.push_back(payload.to_string());
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

/// Dedup filter over all sessions, bounded per session.
#[derive(Debug)]
pub struct DedupFilter {
    sessions: HashMap<String, SeenSet>,
    capacity: usize,
}

impl DedupFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
        }
    }

    /// Has this exact payload been seen for this session?
    pub fn seen(&self, session_id: &str, raw_payload: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.set.contains(raw_payload))
    }

    /// Record a payload; oldest entries are evicted past the capacity.
    pub fn remember(&mut self, session_id: &str, raw_payload: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .remember(raw_payload, self.capacity);
    }

    /// Drop all memory for a session. Called on close.
    pub fn forget_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_payload_is_not_seen() {
        let filter = DedupFilter::new(10);
        assert!(!filter.seen("s1", "{}"));
    }

    #[test]
    fn remembered_payload_is_seen() {
        let mut filter = DedupFilter::new(10);
        filter.remember("s1", r#"{"type":"result"}"#);
        assert!(filter.seen("s1", r#"{"type":"result"}"#));
    }

    #[test]
    fn sessions_are_isolated() {
        let mut filter = DedupFilter::new(10);
        filter.remember("s1", "payload");
        assert!(!filter.seen("s2", "payload"));
    }

    #[test]
    fn equality_is_exact_text() {
        let mut filter = DedupFilter::new(10);
        filter.remember("s1", r#"{"a":1}"#);
        // Semantically identical JSON with different whitespace is distinct.
        assert!(!filter.seen("s1", r#"{"a": 1}"#));
    }

    #[test]
    fn oldest_entries_evicted_at_capacity() {
        let mut filter = DedupFilter::new(3);
        for i in 0..5 {
            filter.remember("s1", &format!("payload-{i}"));
        }
        assert!(!filter.seen("s1", "payload-0"));
        assert!(!filter.seen("s1", "payload-1"));
        assert!(filter.seen("s1", "payload-2"));
        assert!(filter.seen("s1", "payload-4"));
    }

    #[test]
    fn duplicate_remember_does_not_evict() {
        let mut filter = DedupFilter::new(2);
        filter.remember("s1", "a");
        filter.remember("s1", "b");
        filter.remember("s1", "b");
        filter.remember("s1", "b");
        assert!(filter.seen("s1", "a"));
        assert!(filter.seen("s1", "b"));
    }

    #[test]
    fn forget_session_clears_memory() {
        let mut filter = DedupFilter::new(10);
        filter.remember("s1", "payload");
        filter.forget_session("s1");
        assert!(!filter.seen("s1", "payload"));
    }
}
