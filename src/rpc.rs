//! RPC message definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ConsensusError, LogEntry, LogIndex, NodeId, Term};

/// RequestVote RPC - invoked by candidates to gather votes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// Reply to a RequestVote RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// True means the candidate received this node's vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - used for log replication and heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So followers can redirect clients
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Create a heartbeat (empty append entries)
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit,
        }
    }

    /// Check if this is a heartbeat
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reply to an AppendEntries RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower contained an entry matching
    /// `prev_log_index`/`prev_log_term` and accepted the entries
    pub success: bool,

    /// Follower's last log index after handling the request
    pub match_index: LogIndex,
}

/// Request envelope carried by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Candidate soliciting a vote
    RequestVote(RequestVoteRequest),
    /// Leader replicating entries or asserting leadership
    AppendEntries(AppendEntriesRequest),
}

impl RpcRequest {
    /// The kind tag of this request
    pub fn kind(&self) -> RpcKind {
        match self {
            RpcRequest::RequestVote(_) => RpcKind::RequestVote,
            RpcRequest::AppendEntries(_) => RpcKind::AppendEntries,
        }
    }

    /// Decode a call framed as an RPC type name plus JSON payload, the
    /// shape carried by transports that name the RPC out of band. An
    /// unrecognised name is a [`ConsensusError::UnknownRpc`].
    pub fn decode(kind: &str, payload: &[u8]) -> crate::Result<Self> {
        match kind.parse::<RpcKind>()? {
            RpcKind::RequestVote => serde_json::from_slice(payload)
                .map(RpcRequest::RequestVote)
                .map_err(|err| {
                    ConsensusError::Transport(format!("malformed RequestVote payload: {err}"))
                }),
            RpcKind::AppendEntries => serde_json::from_slice(payload)
                .map(RpcRequest::AppendEntries)
                .map_err(|err| {
                    ConsensusError::Transport(format!("malformed AppendEntries payload: {err}"))
                }),
        }
    }
}

/// Response envelope carried by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Reply to a vote solicitation
    RequestVote(RequestVoteResponse),
    /// Reply to replication or heartbeat
    AppendEntries(AppendEntriesResponse),
}

/// The RPC types a node understands. Transports that frame calls with a
/// string type tag parse it through here; anything else is an
/// [`ConsensusError::UnknownRpc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    /// Log replication / heartbeat
    AppendEntries,
    /// Vote solicitation
    RequestVote,
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcKind::AppendEntries => write!(f, "AppendEntries"),
            RpcKind::RequestVote => write!(f, "RequestVote"),
        }
    }
}

impl FromStr for RpcKind {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AppendEntries" => Ok(RpcKind::AppendEntries),
            "RequestVote" => Ok(RpcKind::RequestVote),
            other => Err(ConsensusError::UnknownRpc(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_creation() {
        let heartbeat = AppendEntriesRequest::heartbeat(1, NodeId::new("n1"), 10, 1, 8);

        assert!(heartbeat.is_heartbeat());
        assert_eq!(heartbeat.term, 1);
        assert_eq!(heartbeat.prev_log_index, 10);
        assert!(heartbeat.entries.is_empty());
    }

    #[test]
    fn test_rpc_kind_roundtrip() {
        for kind in [RpcKind::AppendEntries, RpcKind::RequestVote] {
            assert_eq!(kind.to_string().parse::<RpcKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_rpc_kind() {
        let err = "InstallSnapshot".parse::<RpcKind>().unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownRpc(name) if name == "InstallSnapshot"));
    }

    #[test]
    fn test_decode_named_frame() {
        let request = RequestVoteRequest {
            term: 2,
            candidate_id: NodeId::new("n1"),
            last_log_index: 4,
            last_log_term: 1,
        };
        let payload = serde_json::to_vec(&request).unwrap();

        let decoded = RpcRequest::decode("RequestVote", &payload).unwrap();
        let RpcRequest::RequestVote(decoded) = decoded else {
            panic!("expected RequestVote");
        };
        assert_eq!(decoded.term, 2);
        assert_eq!(decoded.candidate_id, NodeId::new("n1"));
    }

    #[test]
    fn test_decode_unknown_name() {
        let err = RpcRequest::decode("InstallSnapshot", b"{}").unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownRpc(name) if name == "InstallSnapshot"));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = RpcRequest::decode("AppendEntries", b"not json").unwrap_err();
        assert!(matches!(err, ConsensusError::Transport(_)));
    }

    #[test]
    fn test_request_kind_tags() {
        let vote = RpcRequest::RequestVote(RequestVoteRequest {
            term: 1,
            candidate_id: NodeId::new("n1"),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert_eq!(vote.kind(), RpcKind::RequestVote);

        let append =
            RpcRequest::AppendEntries(AppendEntriesRequest::heartbeat(1, NodeId::new("n1"), 0, 0, 0));
        assert_eq!(append.kind(), RpcKind::AppendEntries);
    }
}
