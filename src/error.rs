//! Error types for the consensus engine

use thiserror::Error;

use crate::NodeId;

/// Error type for consensus operations
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A client command was sent to a node that is not the leader. Carries
    /// the last-known leader id so the client can redirect.
    #[error("not leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    /// A peer RPC failed at the transport level. Roles absorb this: the
    /// leader retries on the next heartbeat cycle, a candidate counts it as
    /// a non-vote.
    #[error("transport error: {0}")]
    Transport(String),

    /// The persistence backend failed. Never swallowed; surfaced to the
    /// observer channel because it endangers safety.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid timing or identity configuration, detected at first use.
    #[error("configuration error: {0}")]
    Config(String),

    /// A peer invoked an RPC type this node does not recognise.
    #[error("unknown rpc type: {0}")]
    UnknownRpc(String),

    /// The node worker has shut down and no longer accepts requests.
    #[error("node is stopped")]
    Stopped,
}

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

impl ConsensusError {
    /// Build a transport error from any underlying failure.
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }

    /// Build a persistence error from any underlying failure.
    pub fn persistence<E: std::fmt::Display>(err: E) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_hint() {
        let err = ConsensusError::NotLeader(Some(NodeId::new("n2")));
        assert!(err.to_string().contains("n2"));

        let err = ConsensusError::NotLeader(None);
        assert!(err.to_string().contains("None"));
    }

    #[test]
    fn constructors_wrap_messages() {
        let err = ConsensusError::transport("connection refused");
        assert!(matches!(err, ConsensusError::Transport(_)));

        let err = ConsensusError::persistence("disk full");
        assert!(matches!(err, ConsensusError::Persistence(_)));
    }
}
