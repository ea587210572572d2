//! Serialised application of committed entries

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::node::Event;
use crate::storage::Persistence;
use crate::{LogIndex, NodeId, RaftLog};

/// Drains committed-but-unapplied entries to the persistence backend, one at
/// a time and in strict index order.
///
/// At most one application is in flight (`persisting`). Each completed
/// application re-enters the node mailbox as [`Event::ApplyOutcome`]; the
/// node advances `last_applied` and pokes the applier again. A failed
/// application does not skip the entry — the same index is retried on the
/// next poke.
pub(crate) struct LogApplier {
    node_id: NodeId,
    persistence: Arc<dyn Persistence>,
    events: mpsc::Sender<Event>,
    persisting: bool,
}

impl LogApplier {
    pub fn new(
        node_id: NodeId,
        persistence: Arc<dyn Persistence>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            node_id,
            persistence,
            events,
            persisting: false,
        }
    }

    /// Start applying the next committed entry, unless one is already in
    /// flight or there is nothing to apply.
    pub fn maybe_apply(&mut self, commit_index: LogIndex, last_applied: LogIndex, log: &RaftLog) {
        if self.persisting || commit_index <= last_applied {
            return;
        }

        let index = last_applied + 1;
        let Some(entry) = log.get(index).cloned() else {
            // A committed index must be present in the log; losing it would
            // violate durability, so surface rather than skip.
            tracing::error!(node = %self.node_id, index, "committed entry missing from log");
            return;
        };

        self.persisting = true;
        let node_id = self.node_id.clone();
        let persistence = Arc::clone(&self.persistence);
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = persistence.apply_entry(&node_id, index, &entry).await;
            let _ = events.send(Event::ApplyOutcome { index, result }).await;
        });
    }

    /// Mark the in-flight application as finished (success or failure)
    pub fn finish(&mut self) {
        self.persisting = false;
    }
}
