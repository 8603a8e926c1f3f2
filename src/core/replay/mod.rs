// src/core/replay/mod.rs

//! Replication bookkeeping: the persistent replay journal, per-peer
//! bookmarks, and the per-source sequence dedup that makes redelivery
//! harmless.

pub mod bookmarks;
pub mod journal;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub use bookmarks::{BookmarkStore, PeerPositions};
pub use journal::{JournalPosition, JournalRequest, JournalWriterTask};

/// At-most-once bookkeeping. Every outgoing message carries a strictly
/// increasing per-node sequence; receivers keep the highest seen sequence per
/// source and drop anything at or below it.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    own: AtomicU64,
    seen: DashMap<String, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sequence for a locally originated message.
    pub fn next(&self) -> u64 {
        self.own.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Raises the own-sequence floor (journal scan at startup).
    pub fn seed(&self, highest: u64) {
        self.own.fetch_max(highest, Ordering::Relaxed);
    }

    /// Returns true exactly when `sequence` is fresher than anything seen
    /// from `source`, and records it.
    pub fn accept(&self, source: &str, sequence: u64) -> bool {
        let mut entry = self.seen.entry(source.to_string()).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_strictly_increasing() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.next(), 1);
        assert_eq!(tracker.next(), 2);
        tracker.seed(100);
        assert_eq!(tracker.next(), 101);
    }

    #[test]
    fn duplicate_and_out_of_order_messages_are_dropped() {
        let tracker = SequenceTracker::new();
        assert!(tracker.accept("node-b", 5));
        assert!(!tracker.accept("node-b", 5)); // duplicate
        assert!(!tracker.accept("node-b", 3)); // out of order
        assert!(tracker.accept("node-b", 6));
        assert!(tracker.accept("node-c", 1)); // independent per source
    }
}
