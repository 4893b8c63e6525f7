//! Log view over the replicated entry sequence
//!
//! Entries before `first_index()` are covered by a snapshot and only
//! reachable through the snapshot metadata. The view tracks the commit
//! and apply cursors and enforces that both only move forward.

use tracing::debug;

use super::message::{Entry, SnapshotMetadata};

/// In-memory view of the log with snapshot-compacted prefix.
///
/// `entries[0]` (when present) always sits at index `snapshot.index + 1`;
/// the vector is dense and strictly index-increasing by one.
#[derive(Debug, Clone)]
pub struct RaftLog {
    /// Metadata of the snapshot covering the compacted prefix
    snapshot: SnapshotMetadata,
    /// Live suffix of the log
    entries: Vec<Entry>,
    /// Highest index known committed
    committed: u64,
    /// Highest index handed to the state machine
    applied: u64,
}

impl RaftLog {
    /// An empty log with no snapshot.
    pub fn new() -> Self {
        RaftLog {
            snapshot: SnapshotMetadata::default(),
            entries: Vec::new(),
            committed: 0,
            applied: 0,
        }
    }

    /// Rebuild the view from persisted state at host startup.
    ///
    /// `entries` must be dense and start at `snapshot.index + 1`. The
    /// commit cursor restarts at the snapshot boundary; commit state is
    /// re-learned from the leader.
    pub fn from_persisted(snapshot: SnapshotMetadata, entries: Vec<Entry>) -> Self {
        if let Some(first) = entries.first() {
            assert_eq!(
                first.index,
                snapshot.index + 1,
                "persisted log does not continue the snapshot"
            );
        }
        for pair in entries.windows(2) {
            assert_eq!(pair[0].index + 1, pair[1].index, "persisted log has a gap");
        }
        RaftLog {
            committed: snapshot.index,
            applied: snapshot.index,
            snapshot,
            entries,
        }
    }

    /// Index of the first entry still present in the live suffix.
    pub fn first_index(&self) -> u64 {
        self.snapshot.index + 1
    }

    /// Index of the last entry (the snapshot boundary if the suffix is
    /// empty).
    pub fn last_index(&self) -> u64 {
        self.snapshot.index + self.entries.len() as u64
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.snapshot.term,
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.committed
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn snapshot_metadata(&self) -> SnapshotMetadata {
        self.snapshot
    }

    /// Term of the entry at `index`, or 0 when the entry is compacted
    /// away or beyond the end of the log.
    pub fn term(&self, index: u64) -> u64 {
        if index == self.snapshot.index {
            return self.snapshot.term;
        }
        match self.entry(index) {
            Some(entry) => entry.term,
            None => 0,
        }
    }

    /// The entry at `index`, if it lives in the live suffix.
    pub fn entry(&self, index: u64) -> Option<&Entry> {
        if index <= self.snapshot.index || index > self.last_index() {
            return None;
        }
        let offset = (index - self.snapshot.index - 1) as usize;
        self.entries.get(offset)
    }

    /// Entries in `[lo, hi)`. Both bounds must lie inside the live
    /// suffix.
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        assert!(lo >= self.first_index(), "slice below first index");
        assert!(hi <= self.last_index() + 1, "slice beyond last index");
        assert!(lo <= hi, "inverted slice bounds");
        let start = (lo - self.snapshot.index - 1) as usize;
        let end = (hi - self.snapshot.index - 1) as usize;
        &self.entries[start..end]
    }

    /// All entries from `lo` to the end of the log.
    pub fn entries_from(&self, lo: u64) -> &[Entry] {
        self.slice(lo.max(self.first_index()), self.last_index() + 1)
    }

    /// Whether a candidate log ending at `(last_index, last_term)` is at
    /// least as up-to-date as this one.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// Leader-side append of entries already stamped with index and term.
    pub fn append(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            assert_eq!(entry.index, self.last_index() + 1, "leader append out of order");
            self.entries.push(entry);
        }
    }

    /// Follower-side conditional append.
    ///
    /// Succeeds iff the local entry at `prev_index` carries `prev_term`;
    /// a conflicting suffix is truncated and the new entries appended.
    /// Returns `(last_index_of_resulting_log, true)` on success and
    /// `(back_off_hint, false)` on mismatch. The hint is the highest
    /// index whose term does not exceed `prev_term`, which lets the
    /// leader skip whole conflicting terms while probing backwards.
    pub fn try_append(&mut self, prev_index: u64, prev_term: u64, entries: &[Entry]) -> (u64, bool) {
        if self.term(prev_index) != prev_term {
            let mut hint = prev_index.min(self.last_index());
            while hint > self.committed && self.term(hint) > prev_term {
                hint -= 1;
            }
            return (hint, false);
        }

        for (i, entry) in entries.iter().enumerate() {
            if entry.index > self.last_index() {
                self.entries.extend_from_slice(&entries[i..]);
                break;
            }
            if self.term(entry.index) != entry.term {
                // Same index, different term: this entry and everything
                // after it is stale.
                self.truncate_from(entry.index);
                self.entries.extend_from_slice(&entries[i..]);
                break;
            }
            // Entry already present; keep going.
        }
        (self.last_index(), true)
    }

    /// Drop every entry with index >= `from`.
    fn truncate_from(&mut self, from: u64) {
        assert!(from > self.committed, "refusing to truncate committed entries");
        debug!("log truncated from index {} (last was {})", from, self.last_index());
        let keep = (from - self.snapshot.index - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Advance the commit cursor, forward only, never past the last
    /// entry.
    pub fn commit_to(&mut self, index: u64) {
        let target = index.min(self.last_index());
        if target > self.committed {
            self.committed = target;
        }
    }

    /// Record that entries up to `index` have been handed to the state
    /// machine.
    pub fn applied_to(&mut self, index: u64) {
        assert!(index <= self.committed, "applied past commit");
        assert!(index >= self.applied, "applied moved backwards");
        self.applied = index;
    }

    /// Replace the whole log with a snapshot boundary (follower restore).
    pub fn apply_snapshot_meta(&mut self, metadata: SnapshotMetadata) {
        assert!(metadata.index > self.committed, "snapshot does not advance commit");
        self.entries.clear();
        self.snapshot = metadata;
        self.committed = metadata.index;
        self.applied = metadata.index;
    }

    /// Drop entries up to and including `index`, which must already be
    /// applied, and move the snapshot boundary there.
    pub fn compact_to(&mut self, index: u64) {
        assert!(index <= self.applied, "compacting unapplied entries");
        if index < self.first_index() {
            return;
        }
        let term = self.term(index);
        let drop = (index - self.snapshot.index) as usize;
        self.entries.drain(..drop);
        self.snapshot = SnapshotMetadata { index, term };
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        Entry { index, term, data: vec![] }
    }

    fn log_with(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| entry(i as u64 + 1, t))
            .collect();
        log.append(entries);
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term(0), 0);
        assert_eq!(log.term(5), 0);
    }

    #[test]
    fn test_try_append_on_empty() {
        let mut log = RaftLog::new();
        let (last, ok) = log.try_append(0, 0, &[entry(1, 1), entry(2, 1)]);
        assert!(ok);
        assert_eq!(last, 2);
        assert_eq!(log.term(1), 1);
        assert_eq!(log.term(2), 1);
    }

    #[test]
    fn test_try_append_rejects_missing_prev() {
        let mut log = log_with(&[1, 1]);
        let (hint, ok) = log.try_append(5, 2, &[entry(6, 2)]);
        assert!(!ok);
        // Best guess is our own last entry.
        assert_eq!(hint, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_try_append_hint_skips_conflicting_term() {
        // Local log has a run of term-3 entries the leader (term 2 at
        // the probe point) cannot have; the hint should jump below the
        // whole run.
        let mut log = log_with(&[1, 3, 3, 3]);
        let (hint, ok) = log.try_append(4, 2, &[]);
        assert!(!ok);
        assert_eq!(hint, 1);
    }

    #[test]
    fn test_try_append_truncates_conflict() {
        let mut log = log_with(&[1, 1, 2]);
        // Leader overwrites index 2 and 3 with term-3 entries.
        let (last, ok) = log.try_append(1, 1, &[entry(2, 3), entry(3, 3)]);
        assert!(ok);
        assert_eq!(last, 3);
        assert_eq!(log.term(2), 3);
        assert_eq!(log.term(3), 3);
    }

    #[test]
    fn test_try_append_is_idempotent() {
        let mut log = log_with(&[1, 1]);
        let (last, ok) = log.try_append(0, 0, &[entry(1, 1), entry(2, 1)]);
        assert!(ok);
        assert_eq!(last, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_commit_to_clamps_and_is_monotonic() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(10);
        assert_eq!(log.commit_index(), 3);
        log.commit_to(1);
        assert_eq!(log.commit_index(), 3);
    }

    #[test]
    fn test_up_to_date() {
        let log = log_with(&[1, 2]);
        assert!(log.is_up_to_date(2, 2)); // identical
        assert!(log.is_up_to_date(5, 2)); // longer, same term
        assert!(log.is_up_to_date(1, 3)); // higher term wins
        assert!(!log.is_up_to_date(1, 2)); // shorter, same term
        assert!(!log.is_up_to_date(9, 1)); // lower term loses
    }

    #[test]
    fn test_compact_then_lookup() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.commit_to(3);
        log.applied_to(3);
        log.compact_to(3);

        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term(3), 2); // snapshot boundary keeps its term
        assert_eq!(log.term(2), 0); // compacted away
        assert!(log.entry(3).is_none());
        assert_eq!(log.entry(4).unwrap().term, 2);
    }

    #[test]
    fn test_apply_snapshot_meta_resets_log() {
        let mut log = log_with(&[1, 1]);
        log.apply_snapshot_meta(SnapshotMetadata { index: 10, term: 4 });
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert_eq!(log.commit_index(), 10);
        assert_eq!(log.applied(), 10);
        assert_eq!(log.term(10), 4);
    }

    #[test]
    fn test_from_persisted_restarts_commit_at_snapshot() {
        let snap = SnapshotMetadata { index: 2, term: 1 };
        let log = RaftLog::from_persisted(snap, vec![entry(3, 2), entry(4, 2)]);
        assert_eq!(log.commit_index(), 2);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term(4), 2);
    }
}
