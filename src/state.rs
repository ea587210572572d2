//! Node state management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{LogIndex, NodeId, Term};

/// Persistent state (must be durable before any reply that depends on it)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen (initialized to 0, never decreases)
    pub current_term: Term,

    /// Candidate that received this node's vote in `current_term` (or None)
    pub voted_for: Option<NodeId>,
}

/// Volatile state (reconstructed on restart)
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Current believed leader, if any
    pub leader_id: Option<NodeId>,

    /// Highest log index known to be committed
    pub commit_index: LogIndex,

    /// Highest log index applied to the state machine
    pub last_applied: LogIndex,
}

/// Leader-only replication bookkeeping, reinitialized after each election
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each peer, index of the next log entry to send
    next_index: HashMap<NodeId, LogIndex>,

    /// For each peer, highest log index known to be replicated there
    match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    /// Create replication state for the given peers. `next_index` starts
    /// just past the leader's log, `match_index` at 0.
    pub fn new<'a, I>(peers: I, last_log_index: LogIndex) -> Self
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), 0);
        }

        Self {
            next_index,
            match_index,
        }
    }

    /// Start tracking a peer that joined mid-term
    pub fn ensure_peer(&mut self, peer: &NodeId, last_log_index: LogIndex) {
        self.next_index
            .entry(peer.clone())
            .or_insert(last_log_index + 1);
        self.match_index.entry(peer.clone()).or_insert(0);
    }

    /// Next log index to send to a peer
    pub fn next_index(&self, peer: &NodeId) -> LogIndex {
        self.next_index.get(peer).copied().unwrap_or(1)
    }

    /// Highest index known replicated on a peer
    pub fn match_index(&self, peer: &NodeId) -> LogIndex {
        self.match_index.get(peer).copied().unwrap_or(0)
    }

    /// Record successful replication up to `match_idx` on a peer
    pub fn update_progress(&mut self, peer: &NodeId, match_idx: LogIndex) {
        let entry = self.match_index.entry(peer.clone()).or_insert(0);
        // Replies can arrive out of order; progress never moves backwards.
        if match_idx > *entry {
            *entry = match_idx;
        }
        self.next_index.insert(peer.clone(), *entry + 1);
    }

    /// Back off after a failed consistency check (floor of 1)
    pub fn decrement_next_index(&mut self, peer: &NodeId) {
        if let Some(next) = self.next_index.get_mut(peer) {
            if *next > 1 {
                *next -= 1;
            }
        }
    }

    /// Count of peers whose replicated prefix reaches `index`
    pub fn replicated_on(&self, index: LogIndex) -> usize {
        self.match_index.values().filter(|m| **m >= index).count()
    }
}
