//! TTL-bounded dedup set for in-flight escalations.
//!
//! The escalation trigger can be reached from two independent paths
//! (the caregiver-check notification and the deferred re-check), so it
//! guards each logical missed-dose event with a key in this set. Entries
//! expire after a fixed interval even if the holder never removes them,
//! so a silently failed step cannot wedge escalation for that key
//! forever.
//!
//! Key properties:
//! - `try_insert` is the only admission path: it refuses while a live
//!   entry exists, which is what makes double-triggering impossible
//! - Expiry is checked lazily on every lookup; `sweep` exists for
//!   callers that want to bound memory between lookups
//! - Process-local only — each patient's escalation runs exclusively on
//!   that patient's own device, so no external coordination is needed

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::ESCALATION_LOCK_TTL;

/// Set of string keys that forget entries after a TTL.
#[derive(Debug)]
pub struct TtlSet {
    entries: HashMap<String, Instant>,
    ttl: Duration,
}

impl TtlSet {
    /// Create a set with the standard escalation-lock TTL (2 minutes).
    pub fn new() -> Self {
        Self::with_ttl(ESCALATION_LOCK_TTL)
    }

    /// Create a set with an explicit TTL (tests use millisecond TTLs).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn is_live(&self, inserted: Instant) -> bool {
        inserted.elapsed() < self.ttl
    }

    /// Insert the key if no live entry exists. Returns false if a live
    /// entry is already present; an expired entry is replaced.
    pub fn try_insert(&mut self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(&inserted) if self.is_live(inserted) => false,
            _ => {
                self.entries.insert(key.to_string(), Instant::now());
                true
            }
        }
    }

    /// Whether a live entry exists for this key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|&inserted| self.is_live(inserted))
    }

    /// Remove the key (normal completion cleanup).
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop all expired entries. Lookups already ignore expired entries;
    /// this only reclaims the map slots.
    pub fn sweep(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
    }

    /// Number of entries still held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TtlSet {
    fn default() -> Self {
        Self::new()
    }
}
