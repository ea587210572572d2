//! The role state machine: Idle, Follower, Candidate, Leader
//!
//! The node holds exactly one role at a time. Transitioning cancels the old
//! role's fan-out before the new role starts; completions of RPCs issued by
//! a previous role are dropped by the term and role re-checks in each
//! handler.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::net::broadcast::Broadcast;
use crate::node::NodeInner;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::LeaderState;
use crate::{LogIndex, NodeId, Term};

/// The active role and its role-local state
pub(crate) enum Role {
    /// Initial role, before the persistence load completes. Handles no
    /// RPCs; inbound requests wait for the transition to Follower.
    Idle,
    /// Passive role: answers votes and accepts entries from the leader
    Follower,
    /// Transitional role soliciting votes, tallying grants (self included)
    Candidate {
        /// Peers (and self) that granted a vote this term
        votes: HashSet<NodeId>,
    },
    /// Active role driving replication
    Leader {
        /// Per-peer replication progress
        replication: LeaderState,
    },
}

impl Role {
    /// The tag of this role, without its state
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Idle => RoleKind::Idle,
            Role::Follower => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
        }
    }
}

/// Node role, as externally observable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    /// Waiting for the persistence load to complete
    Idle,
    /// Accepts log entries from the leader, votes when asked
    Follower,
    /// Attempting to become leader
    Candidate,
    /// Coordinates log replication
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Idle => write!(f, "Idle"),
            RoleKind::Follower => write!(f, "Follower"),
            RoleKind::Candidate => write!(f, "Candidate"),
            RoleKind::Leader => write!(f, "Leader"),
        }
    }
}

impl NodeInner {
    /// Enter Follower, cancelling the old role's work and restarting the
    /// election timer. Pending client commands fail when leadership is
    /// dropped here.
    pub(crate) fn become_follower(&mut self) {
        self.cancel_role_work();

        if matches!(self.role, Role::Leader { .. }) {
            let leader = self.volatile.leader_id.clone();
            for (_, reply) in self.pending_commands.drain() {
                let _ = reply.send(Err(crate::ConsensusError::NotLeader(leader.clone())));
            }
        }

        let from = self.role.kind();
        self.role = Role::Follower;
        self.reset_election_timer();

        if from != RoleKind::Follower {
            tracing::info!(
                node = %self.id,
                term = self.persistent.current_term,
                %from,
                "became follower"
            );
        }
    }

    /// Adopt a term at least as high as ours and revert to Follower.
    /// `leader` is the new leader when the caller learnt it from the same
    /// message (an AppendEntries), so commands failed during the
    /// transition carry a useful redirect. Returns true when persisted
    /// state changed and needs saving.
    pub(crate) fn step_down(&mut self, term: Term, leader: Option<NodeId>) -> bool {
        let mut dirty = false;
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.volatile.leader_id = leader;
            dirty = true;
        }
        if !matches!(self.role, Role::Follower) {
            self.become_follower();
        }
        dirty
    }

    /// Election timer fired: Followers and Candidates start (or restart) an
    /// election. The timer arm is disabled for leaders.
    pub(crate) async fn on_election_timeout(&mut self) {
        if self.is_leader() {
            return;
        }
        self.start_election().await;
    }

    /// Become Candidate: bump the term, vote for self, persist, then
    /// solicit votes from every peer.
    pub(crate) async fn start_election(&mut self) {
        self.cancel_role_work();
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id.clone());
        self.volatile.leader_id = None;

        let mut votes = HashSet::new();
        votes.insert(self.id.clone());
        self.role = Role::Candidate { votes };

        if let Err(err) = self.save_meta().await {
            // A self-vote that is not durable must not solicit real ones.
            self.report_error(&err);
            self.become_follower();
            return;
        }

        self.reset_election_timer();
        tracing::info!(
            node = %self.id,
            term = self.persistent.current_term,
            "starting election"
        );

        if 1 >= self.quorum() {
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term: self.persistent.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        self.fanout = Some(Broadcast::request_vote(
            self.peers.values(),
            request,
            &self.events_tx,
        ));
    }

    /// A vote solicited by this node's Candidate came back.
    pub(crate) async fn on_vote_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        reply: crate::Result<RequestVoteResponse>,
    ) {
        // The election this reply belongs to may be over.
        if term != self.persistent.current_term || !matches!(self.role, Role::Candidate { .. }) {
            return;
        }

        let resp = match reply {
            Ok(resp) => resp,
            Err(err) => {
                // Transport failure counts as a non-vote.
                tracing::warn!(node = %self.id, %peer, error = %err, "vote request failed");
                return;
            }
        };

        if resp.term > self.persistent.current_term {
            tracing::info!(
                node = %self.id,
                term = resp.term,
                "discovered higher term during election"
            );
            if self.step_down(resp.term, None) {
                if let Err(err) = self.save_meta().await {
                    self.report_error(&err);
                }
            }
            return;
        }

        if !resp.vote_granted || resp.term != self.persistent.current_term {
            return;
        }

        let quorum = self.quorum();
        let won = match &mut self.role {
            Role::Candidate { votes } => {
                votes.insert(peer);
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
    }

    /// Enter Leader: initialise replication progress and immediately assert
    /// leadership with an empty AppendEntries to every peer.
    pub(crate) fn become_leader(&mut self) {
        self.cancel_role_work();

        let last_index = self.log.last_index();
        self.role = Role::Leader {
            replication: LeaderState::new(self.peers.keys(), last_index),
        };
        self.volatile.leader_id = Some(self.id.clone());

        tracing::info!(
            node = %self.id,
            term = self.persistent.current_term,
            "became leader"
        );

        let heartbeat = AppendEntriesRequest::heartbeat(
            self.persistent.current_term,
            self.id.clone(),
            last_index,
            self.log.last_term(),
            self.volatile.commit_index,
        );
        self.fanout = Some(Broadcast::append_entries(
            self.peers.values(),
            heartbeat,
            &self.events_tx,
        ));
        self.next_heartbeat = Instant::now() + self.config.heartbeat();
    }

    /// Send AppendEntries to every peer from its `next_index`, with the
    /// matching previous-entry coordinates and the current commit index.
    pub(crate) fn replicate_all(&self) {
        let Role::Leader { replication } = &self.role else {
            return;
        };

        for peer in self.peers.values() {
            let next = replication.next_index(peer.id());
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = self.log.term(prev_log_index).unwrap_or(0);

            let request = AppendEntriesRequest {
                term: self.persistent.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries: self.log.entries_from(next),
                leader_commit: self.volatile.commit_index,
            };
            peer.append_entries(request, self.events_tx.clone());
        }
    }

    /// A replication request to one peer came back.
    pub(crate) async fn on_append_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        match_hint: LogIndex,
        reply: crate::Result<AppendEntriesResponse>,
    ) {
        // Sent by an earlier incarnation of this node's leadership.
        if term != self.persistent.current_term {
            return;
        }

        let resp = match reply {
            Ok(resp) => resp,
            Err(err) => {
                // Absorbed; the next heartbeat cycle retries.
                tracing::debug!(node = %self.id, %peer, error = %err, "append entries failed");
                return;
            }
        };

        if resp.term > self.persistent.current_term {
            tracing::info!(
                node = %self.id,
                term = resp.term,
                "discovered higher term from append reply"
            );
            if self.step_down(resp.term, None) {
                if let Err(err) = self.save_meta().await {
                    self.report_error(&err);
                }
            }
            return;
        }

        let success = resp.success;
        {
            let Role::Leader { replication } = &mut self.role else {
                return;
            };
            if success {
                replication.update_progress(&peer, match_hint);
            } else {
                replication.decrement_next_index(&peer);
            }
        }
        if success {
            self.advance_commit();
        }
    }

    /// Advance the commit index to the highest entry of the current term
    /// replicated on a majority. Entries from earlier terms are never
    /// committed by counting replicas directly; they commit only below a
    /// committed current-term entry.
    pub(crate) fn advance_commit(&mut self) {
        let quorum = self.quorum();
        let new_commit = {
            let Role::Leader { replication } = &self.role else {
                return;
            };
            let mut candidate = self.volatile.commit_index;
            for n in (self.volatile.commit_index + 1)..=self.log.last_index() {
                if self.log.term(n) != Some(self.persistent.current_term) {
                    continue;
                }
                if replication.replicated_on(n) + 1 >= quorum {
                    candidate = n;
                }
            }
            candidate
        };

        if new_commit > self.volatile.commit_index {
            self.volatile.commit_index = new_commit;
            tracing::debug!(node = %self.id, commit_index = new_commit, "commit index advanced");
            self.poke_applier();
        }
    }

    /// RequestVote handler. Grants iff the candidate's term is current, this
    /// node has not voted for anyone else this term, and the candidate's
    /// log is at least as up-to-date as ours. A granted vote is durable
    /// before the reply leaves; a failed save withholds the reply.
    pub(crate) async fn handle_request_vote(
        &mut self,
        req: RequestVoteRequest,
    ) -> Option<RequestVoteResponse> {
        let RequestVoteRequest {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        } = req;

        let mut dirty = false;
        if term > self.persistent.current_term {
            dirty |= self.step_down(term, None);
        }

        let grant = term >= self.persistent.current_term
            && (self.persistent.voted_for.is_none()
                || self.persistent.voted_for.as_ref() == Some(&candidate_id))
            && self.log.is_up_to_date(last_log_index, last_log_term);

        if grant {
            self.persistent.voted_for = Some(candidate_id.clone());
            dirty = true;
        }

        if dirty {
            if let Err(err) = self.save_meta().await {
                self.report_error(&err);
                return None;
            }
        }

        if grant {
            self.reset_election_timer();
        }

        tracing::debug!(
            node = %self.id,
            candidate = %candidate_id,
            term,
            granted = grant,
            "vote request handled"
        );

        Some(RequestVoteResponse {
            term: self.persistent.current_term,
            vote_granted: grant,
        })
    }

    /// AppendEntries handler. Rejects stale terms, adopts newer ones,
    /// resets the election timer for any current leader, verifies the
    /// previous-entry coordinates, truncates a conflicting suffix, appends
    /// the new entries, and advances the commit index to
    /// `min(leader_commit, last_index)`. All persisted changes are durable
    /// before the reply leaves.
    pub(crate) async fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse> {
        let AppendEntriesRequest {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } = req;

        if term < self.persistent.current_term {
            return Some(AppendEntriesResponse {
                term: self.persistent.current_term,
                success: false,
                match_index: self.log.last_index(),
            });
        }

        // The step-down learns the new leader from this very message, so
        // commands failed during the transition redirect to it.
        let mut dirty = self.step_down(term, Some(leader_id.clone()));
        self.volatile.leader_id = Some(leader_id.clone());
        self.reset_election_timer();

        if self.log.term(prev_log_index) != Some(prev_log_term) {
            if dirty {
                if let Err(err) = self.save_meta().await {
                    self.report_error(&err);
                    return None;
                }
            }
            tracing::debug!(
                node = %self.id,
                leader = %leader_id,
                prev_log_index,
                "log consistency check failed"
            );
            return Some(AppendEntriesResponse {
                term: self.persistent.current_term,
                success: false,
                match_index: self.log.last_index(),
            });
        }

        for entry in entries {
            match self.log.term(entry.index) {
                Some(existing) if existing == entry.term => {
                    // Already present; Log Matching makes it identical.
                }
                Some(_) => {
                    self.log.truncate_from(entry.index);
                    self.log.push(entry);
                    dirty = true;
                }
                None => {
                    self.log.push(entry);
                    dirty = true;
                }
            }
        }

        if leader_commit > self.volatile.commit_index {
            self.volatile.commit_index = leader_commit.min(self.log.last_index());
        }

        if dirty {
            if let Err(err) = self.save_meta().await {
                self.report_error(&err);
                return None;
            }
        }

        self.poke_applier();

        Some(AppendEntriesResponse {
            term: self.persistent.current_term,
            success: true,
            match_index: self.log.last_index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::InMemoryNetwork;
    use crate::node::Event;
    use crate::storage::MemoryPersistence;
    use crate::{LogEntry, RaftConfig};
    use std::sync::Arc;
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        inner: NodeInner,
        persistence: Arc<MemoryPersistence>,
        _mailbox: mpsc::Receiver<Event>,
    }

    fn follower(id: &str, peers: &[&str]) -> Fixture {
        let (tx, mailbox) = mpsc::channel(64);
        let (observers, _) = broadcast::channel(16);
        let persistence = Arc::new(MemoryPersistence::new());
        let transport = Arc::new(InMemoryNetwork::new());

        let mut inner = NodeInner::new(
            NodeId::new(id),
            RaftConfig::default(),
            persistence.clone(),
            transport,
            peers.iter().map(|p| NodeId::new(*p)).collect(),
            tx,
            observers,
        );
        inner.role = Role::Follower;

        Fixture {
            inner,
            persistence,
            _mailbox: mailbox,
        }
    }

    fn entry(index: LogIndex, term: Term, command: &str) -> LogEntry {
        LogEntry::new(index, term, command.as_bytes().to_vec())
    }

    fn vote_req(term: Term, candidate: &str, last_index: LogIndex, last_term: Term) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: NodeId::new(candidate),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[tokio::test]
    async fn vote_granted_and_durable_before_reply() {
        let mut fx = follower("n1", &["n2", "n3"]);

        let resp = fx.inner.handle_request_vote(vote_req(1, "n2", 0, 0)).await.unwrap();

        assert!(resp.vote_granted);
        assert_eq!(resp.term, 1);

        // The grant was persisted before the handler returned.
        let meta = fx.persistence.saved_meta(&NodeId::new("n1")).await.unwrap();
        assert_eq!(meta.current_term, 1);
        assert_eq!(meta.voted_for, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn vote_rejected_for_stale_term() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 5;

        let resp = fx.inner.handle_request_vote(vote_req(3, "n2", 0, 0)).await.unwrap();

        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn at_most_one_vote_per_term() {
        let mut fx = follower("n1", &["n2", "n3"]);

        let first = fx.inner.handle_request_vote(vote_req(2, "n2", 0, 0)).await.unwrap();
        assert!(first.vote_granted);

        let second = fx.inner.handle_request_vote(vote_req(2, "n3", 0, 0)).await.unwrap();
        assert!(!second.vote_granted);

        // Repeat vote for the same candidate stays granted.
        let repeat = fx.inner.handle_request_vote(vote_req(2, "n2", 0, 0)).await.unwrap();
        assert!(repeat.vote_granted);
    }

    #[tokio::test]
    async fn vote_rejected_for_outdated_log() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 2;
        fx.inner.log.push(entry(1, 2, "a"));

        let resp = fx.inner.handle_request_vote(vote_req(3, "n2", 0, 0)).await.unwrap();
        assert!(!resp.vote_granted);
        // The higher term is adopted even when the vote is withheld.
        assert_eq!(fx.inner.persistent.current_term, 3);
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_leader() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 5;

        let req = AppendEntriesRequest::heartbeat(3, NodeId::new("n2"), 0, 0, 0);
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert_eq!(fx.inner.volatile.leader_id, None);
    }

    #[tokio::test]
    async fn append_entries_rejects_missing_prev_entry() {
        let mut fx = follower("n1", &["n2", "n3"]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: NodeId::new("n2"),
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![entry(3, 1, "c")],
            leader_commit: 0,
        };
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(!resp.success);
        assert!(fx.inner.log.is_empty());
        // The leader is still recognised.
        assert_eq!(fx.inner.volatile.leader_id, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn append_entries_truncates_conflicting_suffix() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 2;
        fx.inner.log.push(entry(1, 1, "a"));
        fx.inner.log.push(entry(2, 2, "b"));
        fx.inner.log.push(entry(3, 2, "c"));

        let req = AppendEntriesRequest {
            term: 3,
            leader_id: NodeId::new("n2"),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![entry(2, 3, "b'")],
            leader_commit: 2,
        };
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(resp.success);
        assert_eq!(fx.inner.log.len(), 2);
        assert_eq!(fx.inner.log.get(1).unwrap().command, b"a");
        assert_eq!(fx.inner.log.get(2).unwrap().term, 3);
        assert_eq!(fx.inner.log.get(2).unwrap().command, b"b'");
        assert_eq!(fx.inner.volatile.commit_index, 2);

        // The truncated log was persisted before the reply.
        let meta = fx.persistence.saved_meta(&NodeId::new("n1")).await.unwrap();
        assert_eq!(meta.log.len(), 2);
        assert_eq!(meta.log[1].term, 3);
    }

    #[tokio::test]
    async fn append_entries_commit_capped_by_log_end() {
        let mut fx = follower("n1", &["n2", "n3"]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: NodeId::new("n2"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "a")],
            leader_commit: 10,
        };
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(resp.success);
        assert_eq!(fx.inner.volatile.commit_index, 1);
    }

    #[tokio::test]
    async fn duplicate_append_is_idempotent() {
        let mut fx = follower("n1", &["n2", "n3"]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: NodeId::new("n2"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "a"), entry(2, 1, "b")],
            leader_commit: 0,
        };
        fx.inner.handle_append_entries(req.clone()).await.unwrap();
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(resp.success);
        assert_eq!(fx.inner.log.len(), 2);
    }

    #[tokio::test]
    async fn higher_term_append_steps_candidate_down() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.start_election().await;
        assert_eq!(fx.inner.role.kind(), RoleKind::Candidate);
        let term = fx.inner.persistent.current_term;

        let req = AppendEntriesRequest::heartbeat(term, NodeId::new("n2"), 0, 0, 0);
        let resp = fx.inner.handle_append_entries(req).await.unwrap();

        assert!(resp.success);
        assert_eq!(fx.inner.role.kind(), RoleKind::Follower);
        // Same-term step-down must not forget the self-vote.
        assert_eq!(fx.inner.persistent.voted_for, Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn leader_commits_only_current_term_entries() {
        let mut fx = follower("n1", &["n2", "n3"]);
        let b = NodeId::new("n2");
        let c = NodeId::new("n3");

        // A term-2 entry already replicated everywhere, led by a term-4 node.
        fx.inner.persistent.current_term = 4;
        fx.inner.log.push(entry(1, 2, "old"));
        fx.inner.become_leader();

        {
            let Role::Leader { replication } = &mut fx.inner.role else {
                panic!("expected leader");
            };
            replication.update_progress(&b, 1);
            replication.update_progress(&c, 1);
        }
        fx.inner.advance_commit();
        assert_eq!(fx.inner.volatile.commit_index, 0);

        // A current-term entry above it commits both together.
        fx.inner.log.push(entry(2, 4, "new"));
        {
            let Role::Leader { replication } = &mut fx.inner.role else {
                panic!("expected leader");
            };
            replication.update_progress(&b, 2);
        }
        fx.inner.advance_commit();
        assert_eq!(fx.inner.volatile.commit_index, 2);
    }

    #[tokio::test]
    async fn quorum_sizes() {
        let fx = follower("n1", &[]);
        assert_eq!(fx.inner.quorum(), 1);

        let fx = follower("n1", &["n2", "n3"]);
        assert_eq!(fx.inner.quorum(), 2);

        let fx = follower("n1", &["n2", "n3", "n4", "n5"]);
        assert_eq!(fx.inner.quorum(), 3);
    }

    #[tokio::test]
    async fn election_term_bump_is_durable() {
        let mut fx = follower("n1", &["n2", "n3"]);

        fx.inner.start_election().await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Candidate);
        let meta = fx.persistence.saved_meta(&NodeId::new("n1")).await.unwrap();
        assert_eq!(meta.current_term, 1);
        assert_eq!(meta.voted_for, Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn single_node_election_wins_immediately() {
        let mut fx = follower("n1", &[]);

        fx.inner.start_election().await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Leader);
        assert_eq!(fx.inner.volatile.leader_id, Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn stale_vote_reply_is_dropped() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.start_election().await;
        let old_term = fx.inner.persistent.current_term;
        fx.inner.start_election().await;

        // A grant from the previous election must not count now.
        fx.inner
            .on_vote_reply(
                NodeId::new("n2"),
                old_term,
                Ok(RequestVoteResponse {
                    term: old_term,
                    vote_granted: true,
                }),
            )
            .await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Candidate);
    }

    #[tokio::test]
    async fn majority_vote_wins_election() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.start_election().await;
        let term = fx.inner.persistent.current_term;

        fx.inner
            .on_vote_reply(
                NodeId::new("n2"),
                term,
                Ok(RequestVoteResponse {
                    term,
                    vote_granted: true,
                }),
            )
            .await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Leader);
    }

    #[tokio::test]
    async fn higher_term_vote_reply_steps_down() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.start_election().await;
        let term = fx.inner.persistent.current_term;

        fx.inner
            .on_vote_reply(
                NodeId::new("n2"),
                term,
                Ok(RequestVoteResponse {
                    term: term + 3,
                    vote_granted: false,
                }),
            )
            .await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Follower);
        assert_eq!(fx.inner.persistent.current_term, term + 3);
        assert_eq!(fx.inner.persistent.voted_for, None);
    }

    #[tokio::test]
    async fn failed_append_reply_backs_off_next_index() {
        let mut fx = follower("n1", &["n2", "n3"]);
        let b = NodeId::new("n2");

        fx.inner.persistent.current_term = 1;
        fx.inner.log.push(entry(1, 1, "a"));
        fx.inner.log.push(entry(2, 1, "b"));
        fx.inner.become_leader();
        let term = fx.inner.persistent.current_term;

        fx.inner
            .on_append_reply(
                b.clone(),
                term,
                2,
                Ok(AppendEntriesResponse {
                    term,
                    success: false,
                    match_index: 0,
                }),
            )
            .await;

        let Role::Leader { replication } = &fx.inner.role else {
            panic!("expected leader");
        };
        assert_eq!(replication.next_index(&b), 2);
    }

    #[tokio::test]
    async fn step_down_redirects_pending_commands_to_new_leader() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 3;
        fx.inner.become_leader();

        let (reply, rx) = tokio::sync::oneshot::channel();
        fx.inner.pending_commands.insert(1, reply);

        // A legitimate AppendEntries from the next leader forces the
        // step-down; the failed command must name that leader.
        let req = AppendEntriesRequest::heartbeat(5, NodeId::new("n2"), 0, 0, 0);
        let resp = fx.inner.handle_append_entries(req).await.unwrap();
        assert!(resp.success);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            crate::ConsensusError::NotLeader(Some(leader)) if leader == NodeId::new("n2")
        ));
        assert_eq!(fx.inner.volatile.leader_id, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn higher_term_append_reply_steps_leader_down() {
        let mut fx = follower("n1", &["n2", "n3"]);
        fx.inner.persistent.current_term = 3;
        fx.inner.become_leader();

        fx.inner
            .on_append_reply(
                NodeId::new("n2"),
                3,
                0,
                Ok(AppendEntriesResponse {
                    term: 5,
                    success: false,
                    match_index: 0,
                }),
            )
            .await;

        assert_eq!(fx.inner.role.kind(), RoleKind::Follower);
        assert_eq!(fx.inner.persistent.current_term, 5);
        assert_eq!(fx.inner.persistent.voted_for, None);
        // Nothing committed during the transition.
        assert_eq!(fx.inner.volatile.commit_index, 0);
    }
}
