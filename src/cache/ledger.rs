//! Revision ledger.
//!
//! One monotonic counter per dependency tag. Fingerprints embed the current
//! revision of every tag they depend on, so bumping a tag makes every key
//! issued before the bump unreachable.

use std::collections::HashMap;
use std::sync::RwLock;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::ledger";

#[derive(Debug, Default)]
pub struct RevisionLedger {
    revisions: RwLock<HashMap<String, u64>>,
}

impl RevisionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current revision of `tag`, `0` when the tag was never bumped.
    pub fn get(&self, tag: &str) -> u64 {
        rw_read(&self.revisions, SOURCE, "get")
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    /// Raise `tag` to `value`. Lower values are ignored; the revision in effect
    /// afterwards is returned.
    pub fn set(&self, tag: &str, value: u64) -> u64 {
        let mut revisions = rw_write(&self.revisions, SOURCE, "set");
        let current = revisions.entry(tag.to_string()).or_insert(0);
        *current = (*current).max(value);
        *current
    }

    /// Increment `tag` and return the new revision.
    pub fn bump(&self, tag: &str) -> u64 {
        let mut revisions = rw_write(&self.revisions, SOURCE, "bump");
        let current = revisions.entry(tag.to_string()).or_insert(0);
        *current = current.saturating_add(1);
        *current
    }

    /// Revisions of `tags`, read under a single lock acquisition.
    pub fn snapshot<S: AsRef<str>>(&self, tags: &[S]) -> Vec<u64> {
        let revisions = rw_read(&self.revisions, SOURCE, "snapshot");
        tags.iter()
            .map(|tag| revisions.get(tag.as_ref()).copied().unwrap_or(0))
            .collect()
    }

    /// True when every tag still has the revision recorded in `observed`.
    pub fn matches<S: AsRef<str>>(&self, tags: &[S], observed: &[u64]) -> bool {
        if tags.len() != observed.len() {
            return false;
        }
        let revisions = rw_read(&self.revisions, SOURCE, "matches");
        tags.iter().zip(observed).all(|(tag, seen)| {
            revisions.get(tag.as_ref()).copied().unwrap_or(0) == *seen
        })
    }

    pub fn len(&self) -> usize {
        rw_read(&self.revisions, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every revision. Only called by `Stop`, after the store is empty.
    pub(crate) fn reset(&self) {
        rw_write(&self.revisions, SOURCE, "reset").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn unknown_tags_start_at_zero() {
        let ledger = RevisionLedger::new();
        assert_eq!(ledger.get("users"), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn set_never_lowers_a_revision() {
        let ledger = RevisionLedger::new();
        assert_eq!(ledger.set("perm", 7), 7);
        assert_eq!(ledger.set("perm", 3), 7);
        assert_eq!(ledger.get("perm"), 7);
        assert_eq!(ledger.bump("perm"), 8);
    }

    #[test]
    fn matches_detects_moved_revisions() {
        let ledger = RevisionLedger::new();
        ledger.set("users", 3);
        let tags = ["users", "perm"];
        let observed = ledger.snapshot(&tags);
        assert_eq!(observed, vec![3, 0]);
        assert!(ledger.matches(&tags, &observed));

        ledger.bump("perm");
        assert!(!ledger.matches(&tags, &observed));
    }

    #[test]
    fn concurrent_bumps_are_all_counted() {
        let ledger = Arc::new(RevisionLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.bump("users");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.get("users"), 800);
    }
}
