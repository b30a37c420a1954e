use super::Term;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The state machine command. The log treats it as an opaque payload.
    pub command: Vec<u8>,
}

/// The Raft log stores a sequence of arbitrary commands that are replicated
/// across nodes and surfaced sequentially to the local apply sink. Each entry
/// contains an index, an opaque command, and the term in which the leader
/// proposed it.
///
/// In the steady state the log is append-only: a leader appends client
/// commands to its own log (via [`Log::append`]) and replicates them to
/// followers, who splice them into their logs (via [`Log::splice`]). When an
/// index has been replicated to a majority of nodes it becomes committed,
/// making the log immutable up to that index.
///
/// Uncommitted entries, however, can be replaced: a leader may append entries
/// and then fail to reach consensus on them (e.g. because it's partitioned
/// away from the majority). If a later leader replicates different commands
/// at those indexes, the stale entries are truncated and replaced once the
/// old leader or its followers discover it.
///
/// The log maintains the following invariants:
///
/// * Entry indexes are contiguous starting at 1 (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
///
/// Unlike a production log, this one lives entirely in memory: term, vote,
/// and entries do not survive a process restart.
pub struct Log {
    /// The log entries. Entry i is stored at offset i-1.
    entries: Vec<Entry>,
    /// The index of the last committed entry, or 0 if none.
    commit_index: Index,
}

impl Log {
    /// Creates a new, empty log.
    pub fn new() -> Self {
        Self { entries: Vec::new(), commit_index: 0 }
    }

    /// Returns the commit index, or 0 if none.
    pub fn get_commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the last log index and term, or (0, 0) if the log is empty.
    pub fn get_last_index(&self) -> (Index, Term) {
        self.entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    /// Appends a command to the log at the given term, returning its index.
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> Index {
        assert!(term > 0, "can't append entry in term 0");
        let (last_index, last_term) = self.get_last_index();
        assert!(term >= last_term, "term regression {last_term} → {term}");
        let entry = Entry { index: last_index + 1, term, command };
        self.entries.push(entry);
        last_index + 1
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(
            index >= self.commit_index,
            "commit index regression {} → {index}",
            self.commit_index
        );
        assert!(self.get(index).is_some(), "commit index {index} does not exist");
        self.commit_index = index;
        index
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        index.checked_sub(1).and_then(|offset| self.entries.get(offset as usize))
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Returns the suffix of the log starting at the given index (at least 1).
    /// The suffix may be empty if the index is just past the end of the log.
    pub fn scan_from(&self, index: Index) -> &[Entry] {
        assert!(index > 0, "scan from index 0");
        let offset = (index as usize - 1).min(self.entries.len());
        &self.entries[offset..]
    }

    /// Returns the entries that are ready to apply, starting after the given
    /// applied index up to and including the commit index.
    pub fn scan_apply(&self, applied_index: Index) -> &[Entry] {
        if applied_index >= self.commit_index {
            return &[];
        }
        &self.entries[applied_index as usize..self.commit_index as usize]
    }

    /// Splices a set of entries into the log. The entries must have contiguous
    /// indexes and non-decreasing terms, and must connect to the existing log
    /// (the first index at most last_index + 1). Overlapping indexes with the
    /// same term must be identical and are ignored. An overlapping index with
    /// a different term truncates the existing log from that point before the
    /// new entries are appended; the truncation point must be uncommitted.
    /// Returns the new last index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Index {
        let Some(first) = entries.first() else {
            return self.get_last_index().0; // empty input is a noop
        };

        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );
        assert!(
            first.index <= self.get_last_index().0 + 1,
            "first index {} must touch existing log",
            first.index
        );

        // Skip entries that are already in the log, up to the first index
        // where the terms conflict (if any).
        let mut skip = 0;
        for entry in &entries {
            match self.get(entry.index) {
                Some(existing) if existing.term == entry.term => {
                    assert!(existing.command == entry.command, "command mismatch at {entry:?}");
                    skip += 1;
                }
                _ => break,
            }
        }

        // If all entries already exist then we're done.
        let Some(first) = entries.get(skip) else {
            return self.get_last_index().0;
        };

        // Remove the conflicting tail (if any) and append the new entries. We
        // can't write below the commit index, since those entries must be
        // immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        self.entries.truncate(first.index as usize - 1);
        self.entries.extend(entries.into_iter().skip(skip));
        self.get_last_index().0
    }
}
