//! One remote participant in the cluster

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::net::RaftTransport;
use crate::node::Event;
use crate::rpc::{AppendEntriesRequest, RequestVoteRequest, RpcRequest, RpcResponse};
use crate::{ConsensusError, NodeId, Result};

/// A remote node: its identity, connection state, and the machinery to
/// invoke RPCs on it. Owned by the node for the node's whole lifetime.
pub struct Peer {
    id: NodeId,
    transport: Arc<dyn RaftTransport>,
    connected: bool,
}

impl Peer {
    /// Create a peer handle over the shared transport
    pub fn new(id: NodeId, transport: Arc<dyn RaftTransport>) -> Self {
        Self {
            id,
            transport,
            connected: false,
        }
    }

    /// This peer's identity
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Establish the underlying channel; idempotent.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.transport.connect(&self.id).await?;
        self.connected = true;
        Ok(())
    }

    /// Solicit a vote from this peer. The completion re-enters the node's
    /// mailbox tagged with the term at send time so stale replies can be
    /// dropped.
    pub(crate) fn request_vote(
        &self,
        request: RequestVoteRequest,
        events: mpsc::Sender<Event>,
    ) -> JoinHandle<()> {
        let peer = self.id.clone();
        let transport = Arc::clone(&self.transport);
        let term = request.term;

        tokio::spawn(async move {
            tracing::trace!(%peer, term, "outgoing RequestVote");
            let reply = match transport.call(&peer, RpcRequest::RequestVote(request)).await {
                Ok(RpcResponse::RequestVote(resp)) => Ok(resp),
                Ok(other) => Err(ConsensusError::Transport(format!(
                    "peer {peer} answered RequestVote with {:?}",
                    other
                ))),
                Err(err) => Err(err),
            };
            let _ = events.send(Event::VoteReply { peer, term, reply }).await;
        })
    }

    /// Replicate entries (or a heartbeat) to this peer. `match_hint` is the
    /// last index the peer will hold once it accepts this request, computed
    /// at send time; the leader trusts its own accounting over the
    /// follower's reported log length.
    pub(crate) fn append_entries(
        &self,
        request: AppendEntriesRequest,
        events: mpsc::Sender<Event>,
    ) -> JoinHandle<()> {
        let peer = self.id.clone();
        let transport = Arc::clone(&self.transport);
        let term = request.term;
        let match_hint = request.prev_log_index + request.entries.len() as u64;

        tokio::spawn(async move {
            tracing::trace!(%peer, term, match_hint, "outgoing AppendEntries");
            let reply = match transport.call(&peer, RpcRequest::AppendEntries(request)).await {
                Ok(RpcResponse::AppendEntries(resp)) => Ok(resp),
                Ok(other) => Err(ConsensusError::Transport(format!(
                    "peer {peer} answered AppendEntries with {:?}",
                    other
                ))),
                Err(err) => Err(err),
            };
            let _ = events
                .send(Event::AppendReply {
                    peer,
                    term,
                    match_hint,
                    reply,
                })
                .await;
        })
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .finish()
    }
}
