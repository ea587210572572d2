//! The consensus node: coordinator and public handle
//!
//! A node is a single-context event worker. All mutations of common state,
//! role transitions, and RPC handling happen on one task that owns a
//! mailbox; timers, peer I/O, and persistence completions re-enter the
//! worker as mailbox events. Handlers re-check role and term after every
//! suspension point, so completions that became irrelevant are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::applier::LogApplier;
use crate::net::broadcast::Broadcast;
use crate::net::{Peer, RaftTransport};
use crate::roles::{Role, RoleKind};
use crate::rpc::{
    AppendEntriesResponse, RequestVoteResponse, RpcRequest, RpcResponse,
};
use crate::state::{PersistentState, VolatileState};
use crate::storage::{PersistedMeta, Persistence};
use crate::{ConsensusError, LogEntry, LogIndex, NodeId, RaftConfig, RaftLog, Result, Term};

/// Observable node output: committed entries reaching the state machine,
/// and errors that endanger safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// An entry was durably applied to the state machine
    AppliedLog {
        /// Index of the applied entry
        index: LogIndex,
    },
    /// A persistence or protocol error was surfaced
    Error {
        /// Human-readable description
        message: String,
    },
}

/// Point-in-time snapshot of a node's externally visible state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node identity
    pub id: NodeId,
    /// Current role
    pub role: RoleKind,
    /// Current term
    pub term: Term,
    /// Last-known leader, if any
    pub leader_id: Option<NodeId>,
    /// Highest index known committed
    pub commit_index: LogIndex,
    /// Highest index applied to the state machine
    pub last_applied: LogIndex,
    /// Index of the last log entry
    pub last_log_index: LogIndex,
}

/// Everything that can re-enter the node's serial context.
pub(crate) enum Event {
    Rpc {
        request: RpcRequest,
        reply: oneshot::Sender<RpcResponse>,
    },
    Command {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Join {
        peer: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    VoteReply {
        peer: NodeId,
        term: Term,
        reply: Result<RequestVoteResponse>,
    },
    AppendReply {
        peer: NodeId,
        term: Term,
        match_hint: LogIndex,
        reply: Result<AppendEntriesResponse>,
    },
    ApplyOutcome {
        index: LogIndex,
        result: Result<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running consensus node.
///
/// Cheap to clone; every method forwards into the node's serial worker. The
/// transport hosting this node delivers inbound peer requests through
/// [`RaftNode::handle_rpc`].
#[derive(Debug, Clone)]
pub struct RaftNode {
    id: NodeId,
    tx: mpsc::Sender<Event>,
    observers: broadcast::Sender<NodeEvent>,
}

impl RaftNode {
    /// Validate the configuration and start the node worker. Must be called
    /// within a tokio runtime.
    ///
    /// The node begins Idle, loads persisted metadata and the last-applied
    /// index concurrently, then transitions to Follower. RPCs delivered
    /// before the load completes wait in the mailbox and are handled after
    /// the transition.
    pub fn spawn(
        config: RaftConfig,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn RaftTransport>,
        peers: Vec<NodeId>,
    ) -> Result<Self> {
        config.validate()?;
        let id = config.id.clone().unwrap_or_else(NodeId::generate);

        let (tx, mailbox) = mpsc::channel(256);
        let (observers, _) = broadcast::channel(64);

        let inner = NodeInner::new(
            id.clone(),
            config,
            persistence,
            transport,
            peers,
            tx.clone(),
            observers.clone(),
        );
        tokio::spawn(inner.run(mailbox));

        Ok(Self { id, tx, observers })
    }

    /// This node's identity
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Apply a command to the replicated state machine.
    ///
    /// Succeeds only on the leader, and only once the entry is replicated on
    /// a quorum and durably applied. On a non-leader this fails with
    /// [`ConsensusError::NotLeader`] carrying the last-known leader id.
    pub async fn command(&self, command: Vec<u8>) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command { command, reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await.map_err(|_| ConsensusError::Stopped)?
    }

    /// Add a peer to the cluster
    pub async fn join(&self, peer: NodeId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Join { peer, reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await.map_err(|_| ConsensusError::Stopped)?
    }

    /// Snapshot the node's externally visible state
    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Status { reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await.map_err(|_| ConsensusError::Stopped)
    }

    /// Deliver an inbound peer request and wait for the reply.
    ///
    /// The reply is withheld when the persistence step backing it failed;
    /// the caller observes that as a transport-level failure and retries.
    pub async fn handle_rpc(&self, request: RpcRequest) -> Result<RpcResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Rpc { request, reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await
            .map_err(|_| ConsensusError::Transport("rpc reply withheld".to_string()))
    }

    /// Deliver an inbound request framed as an RPC type name and JSON
    /// payload, the shape string-framed transports carry.
    ///
    /// An unrecognised type name is surfaced on the observer channel as an
    /// error event and returned to the caller.
    pub async fn handle_named_rpc(&self, kind: &str, payload: &[u8]) -> Result<RpcResponse> {
        match RpcRequest::decode(kind, payload) {
            Ok(request) => self.handle_rpc(request).await,
            Err(err) => {
                tracing::error!(node = %self.id, error = %err, "inbound rpc rejected");
                let _ = self.observers.send(NodeEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Gracefully shut down the node worker. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Event::Stop { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Subscribe to applied-log and error events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.observers.subscribe()
    }
}

/// The node worker: owns common state, the peer set, the applier, and the
/// current role.
pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) persistent: PersistentState,
    pub(crate) volatile: VolatileState,
    pub(crate) log: RaftLog,
    pub(crate) role: Role,
    pub(crate) peers: HashMap<NodeId, Peer>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) applier: LogApplier,
    pub(crate) events_tx: mpsc::Sender<Event>,
    pub(crate) observers: broadcast::Sender<NodeEvent>,
    pub(crate) election_deadline: Instant,
    pub(crate) next_heartbeat: Instant,
    pub(crate) fanout: Option<Broadcast>,
    pub(crate) pending_commands: HashMap<LogIndex, oneshot::Sender<Result<LogIndex>>>,
}

impl NodeInner {
    pub(crate) fn new(
        id: NodeId,
        config: RaftConfig,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn RaftTransport>,
        peers: Vec<NodeId>,
        events_tx: mpsc::Sender<Event>,
        observers: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let peers = peers
            .into_iter()
            .filter(|peer| *peer != id)
            .map(|peer| (peer.clone(), Peer::new(peer, Arc::clone(&transport))))
            .collect();
        let applier = LogApplier::new(id.clone(), Arc::clone(&persistence), events_tx.clone());
        let now = Instant::now();

        Self {
            id,
            config,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            log: RaftLog::new(),
            role: Role::Idle,
            peers,
            transport,
            persistence,
            applier,
            events_tx,
            observers,
            election_deadline: now,
            next_heartbeat: now,
            fanout: None,
            pending_commands: HashMap::new(),
        }
    }

    /// The worker loop. Loads persisted state, then processes mailbox
    /// events, election deadlines, and heartbeat ticks until stopped.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::Receiver<Event>) {
        self.load().await;
        if matches!(self.role, Role::Idle) {
            // The load failed; the error has been surfaced and the node
            // never leaves Idle.
            return;
        }

        for peer in self.peers.values_mut() {
            if let Err(err) = peer.connect().await {
                tracing::warn!(node = %self.id, peer = %peer.id(), error = %err, "peer connect failed");
            }
        }

        loop {
            tokio::select! {
                event = mailbox.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(self.election_deadline), if !self.is_leader() => {
                    self.on_election_timeout().await;
                }
                _ = sleep_until(self.next_heartbeat), if self.is_leader() => {
                    self.next_heartbeat = Instant::now() + self.config.heartbeat();
                    self.replicate_all();
                }
            }
        }

        tracing::debug!(node = %self.id, "node worker stopped");
    }

    /// Load persisted metadata and the last-applied commit marker, issued
    /// concurrently; their ordering has no semantic effect.
    async fn load(&mut self) {
        let (meta, last_applied) = tokio::join!(
            self.persistence.load_meta(&self.id),
            self.persistence.last_applied_index(&self.id),
        );

        let (meta, last_applied) = match (meta, last_applied) {
            (Ok(meta), Ok(last_applied)) => (meta, last_applied),
            (Err(err), _) | (_, Err(err)) => {
                self.report_error(&err);
                return;
            }
        };

        if let Some(meta) = meta {
            self.persistent.current_term = meta.current_term;
            self.persistent.voted_for = meta.voted_for;
            self.log = RaftLog::from_entries(meta.log);
        }
        // Applied implies committed; commit_index picks up from there.
        self.volatile.last_applied = last_applied;
        self.volatile.commit_index = last_applied;

        tracing::info!(
            node = %self.id,
            term = self.persistent.current_term,
            last_applied,
            "persisted state loaded"
        );
        self.become_follower();
    }

    /// Dispatch one mailbox event; returns true when the worker must stop.
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Rpc { request, reply } => self.on_rpc(request, reply).await,
            Event::Command { command, reply } => self.on_command(command, reply).await,
            Event::Join { peer, reply } => self.on_join(peer, reply).await,
            Event::Status { reply } => {
                let _ = reply.send(self.status_snapshot());
            }
            Event::VoteReply { peer, term, reply } => {
                self.on_vote_reply(peer, term, reply).await;
            }
            Event::AppendReply {
                peer,
                term,
                match_hint,
                reply,
            } => {
                self.on_append_reply(peer, term, match_hint, reply).await;
            }
            Event::ApplyOutcome { index, result } => self.on_apply_outcome(index, result),
            Event::Stop { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Route an inbound peer request through the current role. The reply is
    /// sent only after the handler has durably saved whatever persisted
    /// state the reply depends on; a handler that could not save withholds
    /// the reply instead.
    async fn on_rpc(&mut self, request: RpcRequest, reply: oneshot::Sender<RpcResponse>) {
        match request {
            RpcRequest::RequestVote(req) => {
                if let Some(resp) = self.handle_request_vote(req).await {
                    let _ = reply.send(RpcResponse::RequestVote(resp));
                }
            }
            RpcRequest::AppendEntries(req) => {
                if let Some(resp) = self.handle_append_entries(req).await {
                    let _ = reply.send(RpcResponse::AppendEntries(resp));
                }
            }
        }
    }

    /// Client command: leader-only. The reply fires once the entry is
    /// applied (which implies quorum replication and durable metadata).
    async fn on_command(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<LogIndex>>) {
        if !self.is_leader() {
            let _ = reply.send(Err(ConsensusError::NotLeader(
                self.volatile.leader_id.clone(),
            )));
            return;
        }

        let index = self.log.last_index() + 1;
        self.log
            .push(LogEntry::new(index, self.persistent.current_term, command));

        if let Err(err) = self.save_meta().await {
            self.report_error(&err);
            let _ = reply.send(Err(err));
            return;
        }

        tracing::debug!(
            node = %self.id,
            index,
            term = self.persistent.current_term,
            "command appended"
        );
        self.pending_commands.insert(index, reply);
        self.replicate_all();
        self.advance_commit();
    }

    async fn on_join(&mut self, peer: NodeId, reply: oneshot::Sender<Result<()>>) {
        if peer == self.id || self.peers.contains_key(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        let mut handle = Peer::new(peer.clone(), Arc::clone(&self.transport));
        match handle.connect().await {
            Ok(()) => {
                if let Role::Leader { replication } = &mut self.role {
                    replication.ensure_peer(&peer, self.log.last_index());
                }
                tracing::info!(node = %self.id, %peer, "peer joined");
                self.peers.insert(peer, handle);
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Completion of one state-machine application.
    fn on_apply_outcome(&mut self, index: LogIndex, result: Result<()>) {
        self.applier.finish();
        match result {
            Ok(()) => {
                self.volatile.last_applied = index;
                let _ = self.observers.send(NodeEvent::AppliedLog { index });
                if let Some(reply) = self.pending_commands.remove(&index) {
                    let _ = reply.send(Ok(index));
                }
                self.poke_applier();
            }
            Err(err) => {
                // The entry is not skipped; the same index is retried on
                // the next commit advance.
                self.report_error(&err);
            }
        }
    }

    fn shutdown(&mut self) {
        self.cancel_role_work();
        for (_, reply) in self.pending_commands.drain() {
            let _ = reply.send(Err(ConsensusError::Stopped));
        }
        tracing::info!(node = %self.id, "stopping");
    }

    fn status_snapshot(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role.kind(),
            term: self.persistent.current_term,
            leader_id: self.volatile.leader_id.clone(),
            commit_index: self.volatile.commit_index,
            last_applied: self.volatile.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    /// Durably save term, vote, and log.
    pub(crate) async fn save_meta(&self) -> Result<()> {
        let meta = PersistedMeta {
            current_term: self.persistent.current_term,
            voted_for: self.persistent.voted_for.clone(),
            log: self.log.entries().to_vec(),
        };
        self.persistence.save_meta(&self.id, &meta).await
    }

    pub(crate) fn poke_applier(&mut self) {
        self.applier
            .maybe_apply(self.volatile.commit_index, self.volatile.last_applied, &self.log);
    }

    pub(crate) fn report_error(&self, err: &ConsensusError) {
        tracing::error!(node = %self.id, error = %err, "consensus error");
        let _ = self.observers.send(NodeEvent::Error {
            message: err.to_string(),
        });
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Majority of the cluster, self included.
    pub(crate) fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub(crate) fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.election_timeout();
    }

    /// Detach any in-flight fan-out; replies already queued are dropped by
    /// the term and role re-checks in their handlers.
    pub(crate) fn cancel_role_work(&mut self) {
        if let Some(mut fanout) = self.fanout.take() {
            fanout.cancel();
        }
    }
}
