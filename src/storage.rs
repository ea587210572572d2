//! Persistence backend interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{ConsensusError, LogEntry, LogIndex, NodeId, Result, Term};

/// The persisted portion of a node's state: everything that must survive a
/// crash before the node may answer an RPC whose reply depends on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedMeta {
    /// Latest term the node has seen
    pub current_term: Term,

    /// Vote cast within `current_term`, if any
    pub voted_for: Option<NodeId>,

    /// The full replicated log
    pub log: Vec<LogEntry>,
}

/// Durable storage interface for consensus state.
///
/// The backend is assumed to serialise writes per node id; `save_meta` and
/// `apply_entry` against the same id may be issued concurrently and must be
/// safe. `save_meta` must be durable on return. `apply_entry` must durably
/// record both the delivery of the command to the state machine and the new
/// last-applied index atomically.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load persisted metadata, or `None` when the node has never saved
    async fn load_meta(&self, node: &NodeId) -> Result<Option<PersistedMeta>>;

    /// Highest log index whose application has been durably recorded (0 if none)
    async fn last_applied_index(&self, node: &NodeId) -> Result<LogIndex>;

    /// Durably save metadata
    async fn save_meta(&self, node: &NodeId, meta: &PersistedMeta) -> Result<()>;

    /// Deliver one committed entry to the state machine and record the new
    /// last-applied index
    async fn apply_entry(&self, node: &NodeId, index: LogIndex, entry: &LogEntry) -> Result<()>;
}

/// In-memory persistence implementation (for testing)
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<RwLock<HashMap<NodeId, MemoryPersistenceInner>>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryPersistenceInner {
    meta: Option<PersistedMeta>,
    applied: Vec<LogEntry>,
}

impl MemoryPersistence {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// The last metadata saved for a node (test inspection)
    pub async fn saved_meta(&self, node: &NodeId) -> Option<PersistedMeta> {
        self.state.read().await.get(node).and_then(|s| s.meta.clone())
    }

    /// The entries applied for a node so far, in application order
    /// (test inspection)
    pub async fn applied_entries(&self, node: &NodeId) -> Vec<LogEntry> {
        self.state
            .read()
            .await
            .get(node)
            .map(|s| s.applied.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_meta(&self, node: &NodeId) -> Result<Option<PersistedMeta>> {
        Ok(self.state.read().await.get(node).and_then(|s| s.meta.clone()))
    }

    async fn last_applied_index(&self, node: &NodeId) -> Result<LogIndex> {
        Ok(self
            .state
            .read()
            .await
            .get(node)
            .map(|s| s.applied.len() as LogIndex)
            .unwrap_or(0))
    }

    async fn save_meta(&self, node: &NodeId, meta: &PersistedMeta) -> Result<()> {
        let mut state = self.state.write().await;
        state.entry(node.clone()).or_default().meta = Some(meta.clone());
        Ok(())
    }

    async fn apply_entry(&self, node: &NodeId, index: LogIndex, entry: &LogEntry) -> Result<()> {
        let mut state = self.state.write().await;
        let inner = state.entry(node.clone()).or_default();

        // Application is strictly sequential; a gap means the caller broke
        // the in-order contract.
        let expected = inner.applied.len() as LogIndex + 1;
        if index != expected {
            return Err(ConsensusError::Persistence(format!(
                "out-of-order apply for {node}: got index {index}, expected {expected}"
            )));
        }

        inner.applied.push(entry.clone());
        Ok(())
    }
}
