//! The replicated log

use serde::{Deserialize, Serialize};

use crate::{LogIndex, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Log index (1-based, assigned by position)
    pub index: LogIndex,

    /// Term when the entry was received by the leader
    pub term: Term,

    /// Opaque command to apply to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new entry
    pub fn new(index: LogIndex, term: Term, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

/// Append-only ordered sequence of log entries with 1-based indexing.
///
/// Mutated only by the node's serial event context; a leader only appends,
/// a follower may overwrite an uncommitted suffix when an authoritative
/// AppendEntries from a later-term leader conflicts with it.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    /// Index of the last entry (0 if the log is empty)
    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry (0 if the log is empty)
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get the entry at `index`, or `None` when absent. Index 0 never holds
    /// an entry.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 reports term 0 so the
    /// prev-entry consistency check is uniform at the log head.
    pub fn term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    /// Append one entry at the tail
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Entries from `start` (inclusive) to the tail
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        if start == 0 {
            return self.entries.clone();
        }
        let offset = (start - 1) as usize;
        if offset >= self.entries.len() {
            return Vec::new();
        }
        self.entries[offset..].to_vec()
    }

    /// Drop the entry at `index` and everything after it. Used only by
    /// followers resolving a conflict against an authoritative leader.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate((index - 1) as usize);
        }
    }

    /// Whether a candidate log described by its last entry is at least as
    /// up-to-date as this one: strictly higher last term, or equal last term
    /// and length at least ours.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index())
    }

    /// All entries, in order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of entries in the log
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
