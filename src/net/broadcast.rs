//! Fan-out of one RPC to every peer

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::net::Peer;
use crate::node::Event;
use crate::rpc::{AppendEntriesRequest, RequestVoteRequest};

/// Ephemeral fan-out of a single request to all peers. Each reply re-enters
/// the node mailbox tagged with the originating peer; quorum accounting
/// stays with the role that started the broadcast.
///
/// Dropping (or [`cancel`](Broadcast::cancel)-ing) the broadcast detaches the
/// listeners: in-flight RPCs may still complete on the remote side but their
/// replies are discarded.
#[derive(Debug)]
pub(crate) struct Broadcast {
    tasks: Vec<JoinHandle<()>>,
}

impl Broadcast {
    /// Solicit votes from every peer with the same request
    pub fn request_vote<'a, I>(
        peers: I,
        request: RequestVoteRequest,
        events: &mpsc::Sender<Event>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Peer>,
    {
        let tasks = peers
            .into_iter()
            .map(|peer| peer.request_vote(request.clone(), events.clone()))
            .collect();
        Self { tasks }
    }

    /// Send the same AppendEntries to every peer (the leader's bring-up
    /// heartbeat)
    pub fn append_entries<'a, I>(
        peers: I,
        request: AppendEntriesRequest,
        events: &mpsc::Sender<Event>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Peer>,
    {
        let tasks = peers
            .into_iter()
            .map(|peer| peer.append_entries(request.clone(), events.clone()))
            .collect();
        Self { tasks }
    }

    /// Detach all reply listeners
    pub fn cancel(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        self.cancel();
    }
}
