//! Session identity map.
//!
//! A session is addressed by a temporary, client-assigned handle until the
//! provider reports its own ID. This map resolves any handle a session has
//! ever had to its current canonical handle so subscriptions and token
//! accounting survive the rename.

use std::collections::HashMap;

/// Maps superseded session handles to their replacements.
///
/// Handles are never reused across sessions, so resolution never needs to
/// disambiguate; it just follows the chain of renames.
#[derive(Debug, Default)]
pub struct SessionIdentityMap {
    forward: HashMap<String, String>,
}

impl SessionIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `old` is now addressed as `new`. Idempotent; mapping a
    /// handle to itself is a no-op.
    pub fn record(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        log::debug!("session handle migrated: {} -> {}", old, new);
        self.forward.insert(old.to_string(), new.to_string());
    }

    /// Resolve a handle to the session's current canonical handle.
    pub fn resolve(&self, handle: &str) -> String {
        let mut current = handle;
        // Follow chained renames (temp -> real -> resumed-real). Handles are
        // never reused, so a cycle would be a programming error; bail after
        // a bounded number of hops rather than loop.
        for _ in 0..8 {
            match self.forward.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current.to_string()
    }

    /// Drop every mapping that resolves to `handle`. Called on session close.
    pub fn forget(&mut self, handle: &str) {
        let canonical = self.resolve(handle);
        let stale: Vec<String> = self
            .forward
            .keys()
            .filter(|old| self.resolve(old) == canonical)
            .cloned()
            .collect();
        for old in stale {
            self.forward.remove(&old);
        }
    }
}
