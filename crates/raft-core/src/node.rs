//! # node
//!
//! why: the replica core, the role state machine that owns all consensus bookkeeping
//! relations: persists through storage.rs, applies to state_machine.rs, dedups with dedup.rs;
//!            driven by the raft-server runtime under a single lock
//! what: NodeState, RaftNode, vote/append handlers, commit advancement, apply pipeline

use crate::config::RaftConfig;
use crate::dedup::DedupCache;
use crate::error::{RaftError, Result};
use crate::log::{is_up_to_date, Command, LogEntry, LogIndex, NodeId, Term};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientResponse, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::state_machine::KvStore;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use tracing::{debug, info, warn};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Leader-side replication progress for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next log index to send
    pub next_index: LogIndex,
    /// Highest index known to be stored on the peer
    pub match_index: LogIndex,
}

/// What happened to a client command handed to the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// Already executed; this is the cached answer
    Duplicate(ClientResponse),
    /// Appended to the leader's log, not yet committed
    Appended { index: LogIndex, term: Term },
}

/// One entry pushed through the state machine by `apply_committed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub client_id: String,
    pub response: ClientResponse,
}

/// A single Raft replica.
///
/// Every method runs to completion without blocking on the network. Durable
/// writes go through `storage` before the matching in-memory field changes,
/// so a failed write leaves the node as it was.
pub struct RaftNode<S: Storage> {
    id: NodeId,
    /// Every member of the fixed cluster, this node included
    cluster_nodes: Vec<NodeId>,
    config: RaftConfig,

    state: NodeState,
    current_term: Term,
    voted_for: Option<NodeId>,

    commit_index: LogIndex,
    last_applied: LogIndex,
    current_leader: Option<NodeId>,

    /// Only populated while leader
    progress: HashMap<NodeId, PeerProgress>,
    /// Only populated while candidate
    votes_received: Vec<NodeId>,

    kv: KvStore,
    dedup: DedupCache,
    storage: S,
}

impl<S: Storage> RaftNode<S> {
    /// Create a follower, resuming from whatever `storage` already holds.
    pub fn new(id: impl Into<NodeId>, cluster_nodes: Vec<NodeId>, storage: S) -> Result<Self> {
        Self::with_config(id, cluster_nodes, RaftConfig::default(), storage)
    }

    pub fn with_config(
        id: impl Into<NodeId>,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
    ) -> Result<Self> {
        let id = id.into();
        if !cluster_nodes.contains(&id) {
            return Err(RaftError::Config {
                reason: format!("node {id} is not a member of {cluster_nodes:?}"),
            });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cluster_nodes.iter().find(|n| !seen.insert(*n)) {
            return Err(RaftError::Config {
                reason: format!("node {dup} listed twice in {cluster_nodes:?}"),
            });
        }
        let (current_term, voted_for) = storage.load_state()?;
        debug!(node = %id, term = current_term, ?voted_for, "loaded persistent state");
        Ok(Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term,
            voted_for,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            progress: HashMap::new(),
            votes_received: Vec::new(),
            kv: KvStore::new(),
            dedup: DedupCache::new(),
            storage,
        })
    }

    // -- accessors --

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn cluster_nodes(&self) -> &[NodeId] {
        &self.cluster_nodes
    }

    /// Every member except this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.cluster_nodes.iter().filter(move |n| **n != self.id)
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Best-known leader, used for redirects.
    pub fn leader(&self) -> Option<&NodeId> {
        self.current_leader.as_ref()
    }

    pub fn progress(&self, peer: &str) -> Option<PeerProgress> {
        self.progress.get(peer).copied()
    }

    pub fn votes_received(&self) -> &[NodeId] {
        &self.votes_received
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    // -- quorum --

    /// Strict majority of the whole cluster.
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- log helpers --

    /// Index and term of the last entry, `(0, 0)` for an empty log.
    pub fn last_log(&self) -> Result<(LogIndex, Term)> {
        Ok(self.storage.last_entry()?.unwrap_or((0, 0)))
    }

    pub fn last_log_index(&self) -> Result<LogIndex> {
        Ok(self.last_log()?.0)
    }

    /// Entries in `[from, to)`.
    pub fn read_log(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.storage.read_entries(from, to)?)
    }

    fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        Ok(self.storage.term_at(index)?.unwrap_or(0))
    }

    // -- role transitions --

    /// Persist `(term, voted_for)`, then adopt it.
    fn persist_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.storage.save_state(term, voted_for.as_ref())?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Step down to follower, adopting `term` if it is newer.
    ///
    /// A newer term clears the vote and the known leader.
    pub fn become_follower(&mut self, term: Term) -> Result<()> {
        if term > self.current_term {
            self.persist_state(term, None)?;
            self.current_leader = None;
        }
        if self.state != NodeState::Follower {
            info!(node = %self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.progress.clear();
        Ok(())
    }

    /// Follower/Candidate -> Candidate for the next term.
    ///
    /// Persists the incremented term and the self-vote before returning the
    /// request to broadcast. A single-node cluster wins on the spot.
    pub fn start_election(&mut self) -> Result<RequestVoteRequest> {
        let term = self.current_term + 1;
        let (last_log_index, last_log_term) = self.last_log()?;
        self.persist_state(term, Some(self.id.clone()))?;

        self.state = NodeState::Candidate;
        self.current_leader = None;
        self.progress.clear();
        self.votes_received = vec![self.id.clone()];
        info!(node = %self.id, term, "starting election");

        if self.has_quorum() {
            self.become_leader()?;
        }

        Ok(RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        })
    }

    /// Candidate -> Leader. Resets replication progress for every peer.
    pub fn become_leader(&mut self) -> Result<()> {
        let last_log_index = self.last_log_index()?;
        self.progress = self
            .peers()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerProgress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();
        self.state = NodeState::Leader;
        self.current_leader = Some(self.id.clone());
        self.votes_received.clear();
        info!(node = %self.id, term = self.current_term, last_log_index, "became leader");
        Ok(())
    }

    // -- RequestVote --

    /// Decide on a vote. The bool asks the caller to reset its election timer.
    ///
    /// A grant is persisted before it is returned.
    pub fn handle_vote_request(
        &mut self,
        request: &RequestVoteRequest,
    ) -> Result<(RequestVoteResponse, bool)> {
        if request.term < self.current_term {
            debug!(node = %self.id, term = self.current_term, candidate = %request.candidate_id,
                stale = request.term, "rejecting vote for stale term");
            return Ok((self.vote_response(false), false));
        }
        // a rival candidate in our own term also ends our candidacy; the
        // self-vote stays, so it is not granted below
        if request.term > self.current_term || self.state == NodeState::Candidate {
            self.become_follower(request.term)?;
        }

        let free_to_vote = self
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == request.candidate_id);
        let (our_index, our_term) = self.last_log()?;
        let log_ok = is_up_to_date(
            request.last_log_index,
            request.last_log_term,
            our_index,
            our_term,
        );

        if !(free_to_vote && log_ok) {
            debug!(node = %self.id, term = self.current_term, candidate = %request.candidate_id,
                free_to_vote, log_ok, "vote denied");
            return Ok((self.vote_response(false), false));
        }

        if self.voted_for.is_none() {
            self.persist_state(self.current_term, Some(request.candidate_id.clone()))?;
        }
        debug!(node = %self.id, term = self.current_term, candidate = %request.candidate_id, "vote granted");
        Ok((self.vote_response(true), true))
    }

    fn vote_response(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true when it made this node leader.
    pub fn handle_vote_response(
        &mut self,
        from: &NodeId,
        response: &RequestVoteResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        // answers to an earlier round carry an older term
        if self.state != NodeState::Candidate || response.term < self.current_term {
            return Ok(false);
        }
        if response.vote_granted && !self.votes_received.contains(from) {
            self.votes_received.push(from.clone());
        }
        if self.has_quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- AppendEntries (follower side) --

    /// Accept or reject replicated entries / a heartbeat. The bool asks the
    /// caller to reset its election timer (any request from a current leader).
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        if request.term < self.current_term {
            return Ok((self.append_response(false, None), false));
        }
        // a current-term leader exists, so candidates (and any same-term leader) yield
        self.become_follower(request.term)?;
        self.current_leader = Some(request.leader_id.clone());

        let prev = request.prev_log_index;
        if prev > 0 && !self.storage.verify_entry_at(prev, request.prev_log_term)? {
            let conflict_index = self.conflict_hint(prev)?;
            debug!(node = %self.id, term = self.current_term, prev, conflict_index, "log mismatch");
            return Ok((self.append_response(false, Some(conflict_index)), true));
        }

        if !request.entries.is_empty() {
            let existing = self.read_log(prev + 1, request.last_covered_index() + 1)?;
            let diverge_at = request
                .entries
                .iter()
                .zip(existing.iter().map(Some).chain(std::iter::repeat(None)))
                .position(|(theirs, ours)| ours.map_or(true, |e| e.term != theirs.term));
            if let Some(pos) = diverge_at {
                let first = request.entries[pos].index;
                if first <= self.commit_index {
                    return Err(RaftError::Storage(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("leader {} tried to overwrite committed index {first}", request.leader_id),
                    )));
                }
                self.storage.save_entries(&request.entries[pos..])?;
                debug!(node = %self.id, from = first, to = request.last_covered_index(), "stored entries");
            }
        }

        let new_commit = request.leader_commit.min(request.last_covered_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }
        Ok((self.append_response(true, None), true))
    }

    /// Where the leader should resume after a mismatch at `prev`.
    ///
    /// Past our tail: right after it. Otherwise: the first index of our
    /// conflicting term, so the whole term is skipped in one round trip.
    /// Committed entries always match, so the scan stops at `commit_index`.
    fn conflict_hint(&self, prev: LogIndex) -> Result<LogIndex> {
        let last = self.last_log_index()?;
        if prev > last {
            return Ok(last + 1);
        }
        let ours = self.read_log(self.commit_index + 1, prev + 1)?;
        let conflict_term = ours.last().map(|e| e.term);
        Ok(ours
            .iter()
            .rev()
            .take_while(|e| Some(e.term) == conflict_term)
            .last()
            .map_or(prev, |e| e.index))
    }

    fn append_response(&self, success: bool, conflict_index: Option<LogIndex>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            conflict_index,
        }
    }

    // -- replication (leader side) --

    /// Build the next AppendEntries for `peer`: everything from its
    /// `next_index`, capped at `max_entries_per_append`. Empty when the peer is
    /// caught up (a heartbeat). `None` when not leader.
    pub fn append_entries_for(&self, peer: &str) -> Result<Option<AppendEntriesRequest>> {
        if self.state != NodeState::Leader {
            return Ok(None);
        }
        let Some(progress) = self.progress.get(peer) else {
            return Ok(None);
        };
        let last_log_index = self.last_log_index()?;
        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.term_at(prev_log_index)?;
        let upto = (progress.next_index + self.config.max_entries_per_append as LogIndex)
            .min(last_log_index + 1);
        let entries = self.read_log(progress.next_index, upto)?;

        Ok(Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Fold a peer's answer into its progress. Returns true when the commit
    /// index advanced.
    ///
    /// Answers to requests from an earlier term, or arriving after this node
    /// stopped leading, are dropped.
    pub fn handle_append_entries_response(
        &mut self,
        peer: &NodeId,
        request: &AppendEntriesRequest,
        response: &AppendEntriesResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            warn!(node = %self.id, peer = %peer, term = response.term, "peer has newer term");
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || request.term != self.current_term {
            return Ok(false);
        }
        let Some(progress) = self.progress.get_mut(peer) else {
            return Ok(false);
        };

        if response.success {
            let matched = request.last_covered_index();
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.match_index + 1;
            return self.advance_commit_index();
        }

        let fallback = request.prev_log_index;
        let next = response
            .conflict_index
            .map_or(fallback, |hint| hint.min(fallback))
            .max(1);
        debug!(node = %self.id, peer = %peer, next_index = next, "backing off after mismatch");
        progress.next_index = next;
        Ok(false)
    }

    /// True when `peer` is missing entries the leader already holds.
    pub fn has_pending(&self, peer: &str) -> Result<bool> {
        let Some(progress) = self.progress.get(peer) else {
            return Ok(false);
        };
        Ok(self.state == NodeState::Leader && progress.next_index <= self.last_log_index()?)
    }

    /// Move `commit_index` to the highest index stored on a majority whose
    /// entry belongs to the current term. Returns true when it moved.
    ///
    /// Older-term entries are never counted directly; they commit along with
    /// the first current-term entry that covers them.
    pub fn advance_commit_index(&mut self) -> Result<bool> {
        if self.state != NodeState::Leader {
            return Ok(false);
        }
        let mut matched: Vec<LogIndex> = self.progress.values().map(|p| p.match_index).collect();
        matched.push(self.last_log_index()?);
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let majority_index = matched[self.quorum_size() - 1];
        if majority_index <= self.commit_index {
            return Ok(false);
        }
        // terms never decrease along the log, so if this entry is from an
        // older term every entry below it is too
        if self.term_at(majority_index)? != self.current_term {
            return Ok(false);
        }
        debug!(node = %self.id, from = self.commit_index, to = majority_index, "commit index advanced");
        self.commit_index = majority_index;
        Ok(true)
    }

    // -- client path --

    /// Hand a client command to this node.
    ///
    /// Not leader: `NotLeader` with the best-known leader. Already executed:
    /// the cached response. Otherwise the command is appended (durably) at
    /// the tail with the current term.
    pub fn propose(&mut self, command: Command) -> Result<Proposal> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader: self.current_leader.clone(),
            });
        }
        if let Some(cached) = self.dedup.lookup(&command.client_id, command.client_serial) {
            debug!(node = %self.id, client = %command.client_id, serial = command.client_serial,
                "duplicate request answered from cache");
            return Ok(Proposal::Duplicate(cached.clone()));
        }

        let index = self.last_log_index()? + 1;
        let term = self.current_term;
        self.storage
            .save_entries(&[LogEntry::new(index, term, command)])?;
        // a lone node is its own majority
        self.advance_commit_index()?;
        Ok(Proposal::Appended { index, term })
    }

    /// Apply every committed, unapplied entry in index order.
    ///
    /// A command whose `(client, serial)` was already executed is not run
    /// again; its cached response is reused. A failed log read changes
    /// nothing and is returned as an error. A log that stops short of the
    /// commit index applies what it has; the rest is left for a later call,
    /// so `last_applied() < commit_index()` afterwards means "try again".
    pub fn apply_committed(&mut self) -> Result<Vec<AppliedEntry>> {
        if self.last_applied >= self.commit_index {
            return Ok(Vec::new());
        }
        let entries = self.read_log(self.last_applied + 1, self.commit_index + 1)?;
        let mut applied = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.index != self.last_applied + 1 {
                warn!(
                    node = %self.id,
                    expected = self.last_applied + 1,
                    found = entry.index,
                    "log gap while applying"
                );
                break;
            }
            let command = &entry.command;
            let response = match self.dedup.lookup(&command.client_id, command.client_serial) {
                Some(cached) => cached.clone(),
                None => {
                    let outcome = self.kv.apply(command);
                    let response =
                        ClientResponse::completed(command.client_serial, outcome.successful, outcome.result);
                    self.dedup.record(&command.client_id, response.clone());
                    response
                }
            };
            self.last_applied = entry.index;
            applied.push(AppliedEntry {
                index: entry.index,
                term: entry.term,
                client_id: entry.command.client_id,
                response,
            });
        }

        if self.last_applied < self.commit_index {
            warn!(
                node = %self.id,
                last_applied = self.last_applied,
                commit_index = self.commit_index,
                "log ends below commit index"
            );
        }
        Ok(applied)
    }
}
