//! In-memory replicated log backed by an append-only file.
//!
//! On disk the log is `data/node-<id>/raft.log`: one JSON-encoded entry per
//! line, fsync'd after every append. In memory it is a contiguous 1-based
//! sequence, offset by the snapshot boundary after compaction. Replay on
//! open stops at the first corrupt or partial line and truncates the file
//! there, so the retained prefix is always contiguous.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;

use crate::message::LogEntry;

pub struct LogStore {
    entries: Vec<LogEntry>,
    /// Last index covered by a snapshot (0 when none). Entries at or below
    /// this index no longer exist in the log.
    snapshot_index: u64,
    snapshot_term: u64,
    commit_index: u64,
    last_applied: u64,
    path: PathBuf,
    file: File,
}

impl LogStore {
    /// Open (or create) the log file under `dir` and replay it. The snapshot
    /// boundary tells replay which indices are already compacted away.
    pub fn open(dir: &Path, snapshot_index: u64, snapshot_term: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("raft.log");

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut good_bytes = 0u64;
        if path.exists() {
            let content = fs::read(&path)?;
            let mut offset = 0usize;
            while offset < content.len() {
                let Some(nl) = content[offset..].iter().position(|&b| b == b'\n') else {
                    warn!(
                        "discarding partial trailing line in {} ({} bytes)",
                        path.display(),
                        content.len() - offset
                    );
                    break;
                };
                match serde_json::from_slice::<LogEntry>(&content[offset..offset + nl]) {
                    Ok(entry) => {
                        if entry.index > snapshot_index {
                            let expected = snapshot_index + entries.len() as u64 + 1;
                            if entry.index != expected {
                                warn!(
                                    "log entry index {} does not follow {}, stopping replay",
                                    entry.index,
                                    expected - 1
                                );
                                break;
                            }
                            entries.push(entry);
                        }
                        offset += nl + 1;
                        good_bytes = offset as u64;
                    }
                    Err(e) => {
                        warn!(
                            "corrupt log line at byte {} of {}: {}; truncating",
                            offset,
                            path.display(),
                            e
                        );
                        break;
                    }
                }
            }
            if good_bytes < content.len() as u64 {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_bytes)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            entries,
            snapshot_index,
            snapshot_term,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            path,
            file,
        })
    }

    /// Index of the first entry still present in the log.
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_index, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    /// Number of entries currently held in memory (excludes the compacted
    /// prefix).
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn set_last_applied(&mut self, index: u64) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }

    /// Term of the entry at `index`, resolving the snapshot boundary.
    /// Index 0 is the empty-log sentinel with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// All retained entries with index >= `from`.
    pub fn entries_from(&self, from: u64) -> &[LogEntry] {
        let first = self.first_index();
        if from < first {
            return &[];
        }
        let start = (from - first) as usize;
        if start >= self.entries.len() {
            &[]
        } else {
            &self.entries[start..]
        }
    }

    /// Leader-side append. Enforces contiguity and term monotonicity and
    /// persists the entry before returning.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            bail!("append at index {} out of order, expected {}", entry.index, expected);
        }
        if entry.term < self.last_term() {
            bail!(
                "append term {} regresses below last term {}",
                entry.term,
                self.last_term()
            );
        }
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.entries.push(entry);
        Ok(())
    }

    /// Follower-side merge for AppendEntries. Returns false when the log does
    /// not contain `prev_index` with `prev_term`; otherwise truncates from
    /// the first conflicting index, appends what extends the log, and
    /// persists.
    pub fn append_all(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<bool> {
        if prev_index > 0 && self.term_at(prev_index) != Some(prev_term) {
            return Ok(false);
        }
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue; // already covered by the snapshot
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue, // already have it
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    self.append(entry)?;
                }
                None => self.append(entry)?,
            }
        }
        Ok(true)
    }

    /// Drop every entry with index >= `index` and rewrite the file.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.snapshot_index {
            bail!("cannot truncate into the compacted prefix at {}", index);
        }
        let keep = (index - self.first_index()) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        if self.commit_index >= index {
            bail!("truncation at {} would drop committed entries", index);
        }
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Snapshot-driven prefix deletion: drop every entry with index <=
    /// `index` and move the snapshot boundary there.
    pub fn delete_up_to(&mut self, index: u64) -> Result<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }
        let term = self
            .term_at(index)
            .with_context(|| format!("no log entry at compaction point {index}"))?;
        let drop_count = ((index - self.first_index()) + 1) as usize;
        self.entries.drain(..drop_count.min(self.entries.len()));
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.rewrite()
    }

    /// Replace the whole log with a snapshot boundary (InstallSnapshot on a
    /// lagging follower).
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) -> Result<()> {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        if self.commit_index < index {
            self.commit_index = index;
        }
        if self.last_applied < index {
            self.last_applied = index;
        }
        self.rewrite()
    }

    /// Raise `commit_index` to `min(n, last_index)`, never lowering it.
    /// Returns true when it moved.
    pub fn advance_commit(&mut self, n: u64) -> bool {
        let target = n.min(self.last_index()).max(self.commit_index);
        let advanced = target > self.commit_index;
        self.commit_index = target;
        advanced
    }

    fn rewrite(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in &self.entries {
                let mut line = serde_json::to_vec(entry)?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntryKind;

    fn put(index: u64, term: u64) -> LogEntry {
        LogEntry::put(
            index,
            term,
            format!("k{index}"),
            format!("v{index}"),
            "c1".to_string(),
            index,
        )
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
            store.append(put(1, 1)).unwrap();
            store.append(put(2, 1)).unwrap();
            store.append(put(3, 2)).unwrap();
            assert_eq!(store.last_index(), 3);
            assert_eq!(store.last_term(), 2);
        }
        let store = LogStore::open(dir.path(), 0, 0).unwrap();
        assert_eq!(store.size(), 3);
        assert_eq!(store.entry(2).unwrap().key, "k2");
        assert_eq!(store.term_at(3), Some(2));
    }

    #[test]
    fn append_rejects_gaps_and_term_regressions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        store.append(put(1, 2)).unwrap();
        assert!(store.append(put(3, 2)).is_err());
        assert!(store.append(put(2, 1)).is_err());
        assert_eq!(store.last_index(), 1);
    }

    #[test]
    fn replay_stops_at_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
            store.append(put(1, 1)).unwrap();
            store.append(put(2, 1)).unwrap();
        }
        // Corrupt the tail: garbage line followed by a valid-looking entry.
        let path = dir.path().join("raft.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        let orphan = serde_json::to_vec(&put(4, 1)).unwrap();
        file.write_all(&orphan).unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);

        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        assert_eq!(store.size(), 2, "entries past the corruption must be dropped");
        assert_eq!(store.last_index(), 2);
        // The file was truncated, so a fresh append lands cleanly at index 3.
        store.append(put(3, 1)).unwrap();
        drop(store);
        let store = LogStore::open(dir.path(), 0, 0).unwrap();
        assert_eq!(store.last_index(), 3);
    }

    #[test]
    fn replay_discards_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
            store.append(put(1, 1)).unwrap();
        }
        let path = dir.path().join("raft.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"index\":2,\"term\":1,\"ki").unwrap();
        drop(file);

        let store = LogStore::open(dir.path(), 0, 0).unwrap();
        assert_eq!(store.last_index(), 1);
    }

    #[test]
    fn append_all_rejects_prev_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        store.append(put(1, 1)).unwrap();
        let ok = store.append_all(1, 9, vec![put(2, 9)]).unwrap();
        assert!(!ok);
        assert_eq!(store.last_index(), 1);
    }

    #[test]
    fn append_all_truncates_conflicts_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        for i in 1..=4 {
            store.append(put(i, 1)).unwrap();
        }
        // New leader overwrites indices 3..4 with term-2 entries and adds 5.
        let ok = store
            .append_all(2, 1, vec![put(3, 2), put(4, 2), put(5, 2)])
            .unwrap();
        assert!(ok);
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.term_at(2), Some(1));
        assert_eq!(store.term_at(3), Some(2));

        // Duplicate delivery of the same entries is a no-op.
        let ok = store
            .append_all(2, 1, vec![put(3, 2), put(4, 2), put(5, 2)])
            .unwrap();
        assert!(ok);
        assert_eq!(store.last_index(), 5);
    }

    #[test]
    fn truncation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
            for i in 1..=5 {
                store.append(put(i, 1)).unwrap();
            }
            store.truncate_from(3).unwrap();
            assert_eq!(store.last_index(), 2);
        }
        let store = LogStore::open(dir.path(), 0, 0).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn delete_up_to_moves_snapshot_boundary() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
            for i in 1..=6 {
                store.append(put(i, 2)).unwrap();
            }
            store.advance_commit(6);
            store.delete_up_to(4).unwrap();
            assert_eq!(store.first_index(), 5);
            assert_eq!(store.size(), 2);
            assert_eq!(store.term_at(4), Some(2));
            assert_eq!(store.entry(4), None);
            assert_eq!(store.entry(5).unwrap().kind, EntryKind::Put);
        }
        let store = LogStore::open(dir.path(), 4, 2).unwrap();
        assert_eq!(store.first_index(), 5);
        assert_eq!(store.last_index(), 6);
    }

    #[test]
    fn advance_commit_is_monotonic_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        store.append(put(1, 1)).unwrap();
        store.append(put(2, 1)).unwrap();
        assert!(store.advance_commit(5));
        assert_eq!(store.commit_index(), 2, "clamped to last index");
        assert!(!store.advance_commit(1), "never decreases");
        assert_eq!(store.commit_index(), 2);
    }

    #[test]
    fn reset_to_snapshot_empties_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), 0, 0).unwrap();
        for i in 1..=3 {
            store.append(put(i, 1)).unwrap();
        }
        store.reset_to_snapshot(10, 3).unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.last_index(), 10);
        assert_eq!(store.last_term(), 3);
        assert_eq!(store.commit_index(), 10);
        assert_eq!(store.last_applied(), 10);
        // Replication resumes from the boundary.
        store.append(put(11, 3)).unwrap();
        assert_eq!(store.last_index(), 11);
    }
}
