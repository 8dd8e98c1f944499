//! The replicated key-value state machine.
//!
//! Committed log entries are applied here in strictly increasing index
//! order. A per-client map of the highest applied sequence number enforces
//! at-most-once semantics: a duplicate command re-derives its result from
//! the current state instead of being applied again. Reads are served from
//! local state under the machine's own lock, so they never touch the
//! consensus lock (and may be stale on followers).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::message::{EntryKind, LogEntry};

/// Result of applying one entry, delivered to the client future that
/// proposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// PUT: the stored value.
    Value(String),
    /// DELETE: whether the key existed and was removed.
    Removed(bool),
    /// NO_OP: internal, never surfaced to clients.
    NoOp,
}

#[derive(Default)]
struct KvInner {
    data: HashMap<String, String>,
    sequences: HashMap<String, u64>,
}

#[derive(Default)]
pub struct KvStateMachine {
    inner: Mutex<KvInner>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry. Duplicates (sequence at or below the
    /// highest already applied for the client) leave state untouched.
    pub fn apply(&self, entry: &LogEntry) -> ApplyOutcome {
        let mut inner = self.inner.lock().expect("kv state machine lock poisoned");

        if let (Some(client), Some(sequence)) = (&entry.client_id, entry.sequence) {
            if inner.sequences.get(client).copied().unwrap_or(0) >= sequence {
                // Re-derive the result from current state without applying.
                return match entry.kind {
                    EntryKind::Put => ApplyOutcome::Value(
                        inner
                            .data
                            .get(&entry.key)
                            .cloned()
                            .or_else(|| entry.value.clone())
                            .unwrap_or_default(),
                    ),
                    EntryKind::Delete => {
                        ApplyOutcome::Removed(inner.data.contains_key(&entry.key))
                    }
                    EntryKind::NoOp => ApplyOutcome::NoOp,
                };
            }
        }

        let outcome = match entry.kind {
            EntryKind::Put => {
                let value = entry.value.clone().unwrap_or_default();
                inner.data.insert(entry.key.clone(), value.clone());
                ApplyOutcome::Value(value)
            }
            EntryKind::Delete => ApplyOutcome::Removed(inner.data.remove(&entry.key).is_some()),
            EntryKind::NoOp => ApplyOutcome::NoOp,
        };

        if let (Some(client), Some(sequence)) = (&entry.client_id, entry.sequence) {
            inner.sequences.insert(client.clone(), sequence);
        }
        outcome
    }

    /// Local read; potentially stale on a follower.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("kv state machine lock poisoned")
            .data
            .get(key)
            .cloned()
    }

    /// Highest applied sequence for a client, if any command of theirs has
    /// been applied.
    pub fn client_sequence(&self, client_id: &str) -> Option<u64> {
        self.inner
            .lock()
            .expect("kv state machine lock poisoned")
            .sequences
            .get(client_id)
            .copied()
    }

    /// Copy of the full state, captured for a snapshot.
    pub fn image(&self) -> (HashMap<String, String>, HashMap<String, u64>) {
        let inner = self.inner.lock().expect("kv state machine lock poisoned");
        (inner.data.clone(), inner.sequences.clone())
    }

    /// Overwrite state from a snapshot image.
    pub fn restore(&self, data: HashMap<String, String>, sequences: HashMap<String, u64>) {
        let mut inner = self.inner.lock().expect("kv state machine lock poisoned");
        inner.data = data;
        inner.sequences = sequences;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let kv = KvStateMachine::new();
        let outcome = kv.apply(&LogEntry::put(1, 1, "k".into(), "v".into(), "c1".into(), 1));
        assert_eq!(outcome, ApplyOutcome::Value("v".to_string()));
        assert_eq!(kv.get("k"), Some("v".to_string()));
        assert_eq!(kv.get("missing"), None);
    }

    #[test]
    fn delete_reports_presence() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "k".into(), "v".into(), "c1".into(), 1));
        assert_eq!(
            kv.apply(&LogEntry::delete(2, 1, "k".into(), "c1".into(), 2)),
            ApplyOutcome::Removed(true)
        );
        assert_eq!(
            kv.apply(&LogEntry::delete(3, 1, "k".into(), "c1".into(), 3)),
            ApplyOutcome::Removed(false)
        );
        assert_eq!(kv.get("k"), None);
    }

    #[test]
    fn no_op_leaves_state_untouched() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "k".into(), "v".into(), "c1".into(), 1));
        assert_eq!(kv.apply(&LogEntry::no_op(2, 2)), ApplyOutcome::NoOp);
        assert_eq!(kv.get("k"), Some("v".to_string()));
        assert_eq!(kv.client_sequence("c1"), Some(1));
    }

    #[test]
    fn duplicate_put_is_applied_once() {
        let kv = KvStateMachine::new();
        let entry = LogEntry::put(1, 1, "k".into(), "v".into(), "c1".into(), 7);
        assert_eq!(kv.apply(&entry), ApplyOutcome::Value("v".to_string()));

        // Retry lands at a later index but carries the same sequence.
        let retry = LogEntry::put(2, 1, "k".into(), "v".into(), "c1".into(), 7);
        assert_eq!(kv.apply(&retry), ApplyOutcome::Value("v".to_string()));
        assert_eq!(kv.client_sequence("c1"), Some(7));
        assert_eq!(kv.get("k"), Some("v".to_string()));
    }

    #[test]
    fn duplicate_delete_re_derives_from_current_state() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "k1".into(), "v".into(), "c2".into(), 1));
        assert_eq!(
            kv.apply(&LogEntry::delete(2, 1, "k1".into(), "c1".into(), 5)),
            ApplyOutcome::Removed(true)
        );

        // Retry while the key stays absent.
        let retry = LogEntry::delete(3, 1, "k1".into(), "c1".into(), 5);
        assert_eq!(kv.apply(&retry), ApplyOutcome::Removed(false));

        // Another client re-creates the key; the same retry now reports it
        // present, and must not remove it.
        kv.apply(&LogEntry::put(4, 1, "k1".into(), "w".into(), "c2".into(), 2));
        assert_eq!(kv.apply(&retry), ApplyOutcome::Removed(true));
        assert_eq!(kv.get("k1"), Some("w".to_string()));
        assert_eq!(kv.client_sequence("c1"), Some(5));
    }

    #[test]
    fn stale_sequence_does_not_clobber_newer_write() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "k".into(), "new".into(), "c1".into(), 5));
        let stale = LogEntry::put(2, 1, "k".into(), "old".into(), "c1".into(), 3);
        assert_eq!(kv.apply(&stale), ApplyOutcome::Value("new".to_string()));
        assert_eq!(kv.get("k"), Some("new".to_string()));
        assert_eq!(kv.client_sequence("c1"), Some(5));
    }

    #[test]
    fn sequences_are_tracked_per_client() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "a".into(), "1".into(), "c1".into(), 9));
        kv.apply(&LogEntry::put(2, 1, "b".into(), "2".into(), "c2".into(), 1));
        assert_eq!(kv.client_sequence("c1"), Some(9));
        assert_eq!(kv.client_sequence("c2"), Some(1));
        assert_eq!(kv.get("b"), Some("2".to_string()));
    }

    #[test]
    fn image_restore_round_trip() {
        let kv = KvStateMachine::new();
        kv.apply(&LogEntry::put(1, 1, "k".into(), "v".into(), "c1".into(), 4));
        let (data, sequences) = kv.image();

        let restored = KvStateMachine::new();
        restored.restore(data, sequences);
        assert_eq!(restored.get("k"), Some("v".to_string()));
        assert_eq!(restored.client_sequence("c1"), Some(4));
    }
}
