//! Bounded loop-suppression registry for the forwarder.

use std::collections::HashSet;

/// Tracks recently processed `message_id`s so the same message is never
/// forwarded twice. Coarse purge on overflow rather than LRU eviction: once
/// the set passes `limit` entries it is cleared outright. A previously seen
/// id can therefore be re-accepted shortly after a purge; `MessageStore`
/// insert is idempotent and integrity/TTL checks still apply, so this
/// weakens loop suppression under sustained load without weakening
/// correctness.
pub struct SeenSet {
    seen: HashSet<String>,
    limit: usize,
}

impl SeenSet {
    pub fn new(limit: usize) -> Self {
        Self {
            seen: HashSet::new(),
            limit,
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Record `message_id` as seen, purging the whole set first if it has
    /// grown past `limit`.
    pub fn insert(&mut self, message_id: String) {
        if self.seen.len() >= self.limit {
            self.seen.clear();
        }
        self.seen.insert(message_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
