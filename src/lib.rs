//! # RaftForge Consensus Engine
//!
//! A node participating in a replicated state-machine consensus protocol of
//! the Raft family. A cluster of nodes elects a single leader that serialises
//! client commands into a replicated log; followers apply committed entries in
//! the same order, producing identical state across surviving nodes despite
//! crashes, message loss, reordering, and partitions.
//!
//! ## Architecture
//!
//! The crate is the consensus engine only. The physical transport between
//! nodes and the durable storage backend are external collaborators reached
//! through traits:
//!
//! - **Log Layer**: the ordered, 1-based sequence of `{term, command}` entries
//! - **Network Layer**: the [`net::RaftTransport`] seam, per-peer connections,
//!   and RPC fan-out
//! - **Persistence Layer**: the [`storage::Persistence`] seam for durable
//!   metadata and applied-commit markers
//! - **Role Layer**: the Idle/Follower/Candidate/Leader state machine with
//!   election and replication timers
//! - **Node Layer**: the single-context event worker routing RPCs, timers, and
//!   client commands through the current role

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]
#![deny(unsafe_code)]

pub mod applier;
pub mod config;
pub mod error;
pub mod log;
pub mod net;
pub mod node;
pub mod roles;
pub mod rpc;
pub mod state;
pub mod storage;

pub use config::RaftConfig;
pub use error::{ConsensusError, Result};
pub use log::{LogEntry, RaftLog};
pub use node::{NodeEvent, NodeStatus, RaftNode};
pub use roles::RoleKind;
pub use storage::{MemoryPersistence, PersistedMeta, Persistence};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Term number: a monotonically increasing logical clock with at most one
/// leader per term.
pub type Term = u64;

/// Position of an entry in the replicated log (1-based; 0 means "no entry").
pub type LogIndex = u64;

/// Stable string identity of a node in the cluster.
///
/// Supplied by the host or generated at construction; survives restarts when
/// the host passes the same id back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an externally supplied identity.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
