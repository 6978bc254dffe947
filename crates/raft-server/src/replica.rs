//! # replica
//!
//! why: drive a raft-core node over a real (async) network
//! relations: wraps RaftNode from raft-core, talks through transport.rs, times out with timer.rs
//! what: Replica handle, election/replication/apply/rpc tasks, blocking client request path
//!
//! All replica state lives behind one mutex that is never held across an
//! await. Network calls are made with the lock released and their results
//! folded back in under the lock; raft-core drops any answer that belongs to
//! a term the replica has since left.

use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver, Transport};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use raft_core::{
    AppendEntriesRequest, ClientRequest, ClientResponse, LogEntry, LogIndex, NodeId, NodeState,
    Proposal, RaftConfig, RaftError, RaftNode, RequestVoteRequest, Result, Storage, Term,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Point-in-time view of a replica, for observation and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub role: NodeState,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader: Option<NodeId>,
}

/// A client request appended at `index` waiting to be applied.
struct Waiter {
    term: Term,
    tx: oneshot::Sender<Result<ClientResponse>>,
}

/// Replication tasks owned by one leadership term.
struct Leadership {
    term: Term,
    replicators: Vec<(Arc<Notify>, JoinHandle<()>)>,
}

impl Leadership {
    fn poke(&self) {
        for (poke, _) in &self.replicators {
            poke.notify_one();
        }
    }

    fn abort(self) {
        for (_, handle) in self.replicators {
            handle.abort();
        }
    }
}

struct Shared {
    node: RaftNode<Box<dyn Storage>>,
    waiters: HashMap<LogIndex, Waiter>,
    leadership: Option<Leadership>,
    stopped: bool,
}

struct Inner {
    id: NodeId,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    timer: ElectionTimer,
    apply_wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running replica. Cloning gives another handle to the same replica.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<Inner>,
}

impl Replica {
    /// Start a replica and its background tasks.
    ///
    /// `peers` are the other cluster members. Persisted term, vote and log
    /// are picked up from `storage`; commit and apply progress start at zero
    /// and are re-learned from the leader. Must be called inside a tokio
    /// runtime.
    pub fn start<S: Storage + 'static>(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
        transport: Arc<dyn Transport>,
        inbox: RpcReceiver,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let mut cluster = peers;
        if !cluster.contains(&id) {
            cluster.push(id.clone());
        }
        let storage: Box<dyn Storage> = Box::new(storage);
        let node = RaftNode::with_config(id.clone(), cluster, config.clone(), storage)?;
        info!(node = %id, term = node.current_term(), "starting replica");

        let (shutdown_tx, _) = broadcast::channel(4);
        let inner = Arc::new(Inner {
            id,
            timer: ElectionTimer::new(config.clone()),
            config,
            transport,
            shared: Mutex::new(Shared {
                node,
                waiters: HashMap::new(),
                leadership: None,
                stopped: false,
            }),
            apply_wake: Notify::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let handles = vec![
            tokio::spawn(election_loop(inner.clone(), inner.shutdown_tx.subscribe())),
            tokio::spawn(apply_loop(inner.clone(), inner.shutdown_tx.subscribe())),
            tokio::spawn(rpc_handler_loop(inner.clone(), inbox, inner.shutdown_tx.subscribe())),
        ];
        inner.tasks.lock().extend(handles);

        Ok(Self { inner })
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn status(&self) -> ReplicaStatus {
        let shared = self.inner.shared.lock();
        let node = &shared.node;
        ReplicaStatus {
            role: node.state(),
            term: node.current_term(),
            commit_index: node.commit_index(),
            last_applied: node.last_applied(),
            leader: node.leader().cloned(),
        }
    }

    /// The whole local log.
    pub fn read_log(&self) -> Result<Vec<LogEntry>> {
        let shared = self.inner.shared.lock();
        let last = shared.node.last_log_index()?;
        shared.node.read_log(1, last + 1)
    }

    /// Copy of the applied key/value data.
    pub fn kv_snapshot(&self) -> BTreeMap<String, String> {
        self.inner.shared.lock().node.kv().snapshot()
    }

    /// Run a client request to completion.
    ///
    /// Off the leader this answers at once with a redirect. On the leader a
    /// new command is appended and the call waits until it is applied; a
    /// retried one gets its cached response. If leadership is lost or
    /// `client_timeout` passes first, the answer is a redirect to the
    /// best-known leader so the client can retry.
    pub async fn handle_client_request(&self, request: ClientRequest) -> Result<ClientResponse> {
        let inner = &self.inner;
        let (index, rx) = {
            let mut shared = inner.shared.lock();
            if shared.stopped {
                return Err(RaftError::Shutdown);
            }
            match shared.node.propose(request.into_command()) {
                Err(RaftError::NotLeader { leader }) => {
                    debug!(node = %inner.id, ?leader, "redirecting client");
                    return Ok(ClientResponse::redirect(leader));
                }
                Err(e) => {
                    error!(node = %inner.id, error = %e, "failed to append client command");
                    return Err(e);
                }
                Ok(Proposal::Duplicate(cached)) => return Ok(cached),
                Ok(Proposal::Appended { index, term }) => {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.insert(index, Waiter { term, tx });
                    if let Some(leadership) = &shared.leadership {
                        leadership.poke();
                    }
                    if shared.node.commit_index() >= index {
                        inner.apply_wake.notify_one();
                    }
                    (index, rx)
                }
            }
        };

        match timeout(inner.config.client_deadline(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                let mut shared = inner.shared.lock();
                shared.waiters.remove(&index);
                warn!(node = %inner.id, index, "client request timed out");
                Ok(ClientResponse::redirect(shared.node.leader().cloned()))
            }
        }
    }

    /// Stop every background task and fail pending client requests with
    /// `RaftError::Shutdown`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut shared = inner.shared.lock();
            if shared.stopped {
                return;
            }
            shared.stopped = true;
            if let Some(leadership) = shared.leadership.take() {
                leadership.abort();
            }
            for (_, waiter) in shared.waiters.drain() {
                let _ = waiter.tx.send(Err(RaftError::Shutdown));
            }
        }
        info!(node = %inner.id, "replica shutting down");
        let _ = inner.shutdown_tx.send(());

        let handles: Vec<_> = inner.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Inner {
    /// Line the runtime up with the node's role after any state change.
    ///
    /// Gaining leadership spawns one replication task per peer for this term.
    /// Losing it aborts them and fails every waiting client with a redirect.
    fn reconcile(self: &Arc<Self>, shared: &mut Shared) {
        if shared.stopped {
            return;
        }
        let term = shared.node.current_term();
        let leading = shared.node.is_leader();

        if let Some(leadership) = &shared.leadership {
            if leading && leadership.term == term {
                return;
            }
        }
        if let Some(old) = shared.leadership.take() {
            warn!(node = %self.id, term = old.term, "leadership lost");
            old.abort();
            let leader = shared.node.leader().cloned();
            for (_, waiter) in shared.waiters.drain() {
                let _ = waiter.tx.send(Ok(ClientResponse::redirect(leader.clone())));
            }
        }
        if !leading {
            return;
        }

        info!(node = %self.id, term, "leading, starting replication");
        let replicators = shared
            .node
            .peers()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|peer| {
                let poke = Arc::new(Notify::new());
                let handle = tokio::spawn(replicate_loop(self.clone(), peer, term, poke.clone()));
                (poke, handle)
            })
            .collect();
        shared.leadership = Some(Leadership { term, replicators });
    }

    /// Become candidate and ask every peer for a vote in the background.
    fn start_election(self: &Arc<Self>) {
        let (request, peers) = {
            let mut shared = self.shared.lock();
            if shared.stopped || shared.node.is_leader() {
                return;
            }
            let request = match shared.node.start_election() {
                Ok(request) => request,
                Err(e) => {
                    error!(node = %self.id, error = %e, "could not start election");
                    return;
                }
            };
            self.reconcile(&mut shared);
            let peers: Vec<NodeId> = shared.node.peers().cloned().collect();
            (request, peers)
        };
        tokio::spawn(solicit_votes(self.clone(), request, peers));
    }

    /// Returns true while committed entries remain unapplied.
    fn apply_committed(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.stopped {
            return false;
        }
        let applied = match shared.node.apply_committed() {
            Ok(applied) => applied,
            Err(e) => {
                error!(node = %self.id, error = %e, "apply failed");
                Vec::new()
            }
        };
        for entry in applied {
            let Some(waiter) = shared.waiters.remove(&entry.index) else {
                continue;
            };
            // another leader's entry took this slot
            let response = if waiter.term == entry.term {
                entry.response
            } else {
                ClientResponse::redirect(shared.node.leader().cloned())
            };
            let _ = waiter.tx.send(Ok(response));
        }
        shared.node.last_applied() < shared.node.commit_index()
    }

    fn handle_rpc(self: &Arc<Self>, msg: RpcMessage) {
        let mut shared = self.shared.lock();
        if shared.stopped {
            return;
        }
        match msg {
            RpcMessage::RequestVote { request, response_tx } => {
                match shared.node.handle_vote_request(&request) {
                    Ok((response, reset_timer)) => {
                        if reset_timer {
                            self.timer.reset();
                        }
                        self.reconcile(&mut shared);
                        let _ = response_tx.send(response);
                    }
                    Err(e) => {
                        // no answer: the candidate sees a failed call
                        error!(node = %self.id, error = %e, "failed to handle RequestVote");
                    }
                }
            }
            RpcMessage::AppendEntries { request, response_tx } => {
                let commit_before = shared.node.commit_index();
                match shared.node.handle_append_entries(&request) {
                    Ok((response, reset_timer)) => {
                        if reset_timer {
                            self.timer.reset();
                        }
                        if shared.node.commit_index() > commit_before {
                            self.apply_wake.notify_one();
                        }
                        self.reconcile(&mut shared);
                        let _ = response_tx.send(response);
                    }
                    Err(e) => {
                        error!(node = %self.id, error = %e, "failed to handle AppendEntries");
                    }
                }
            }
        }
    }
}

/// Waits out the election timer and starts an election each time it fires.
async fn election_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = inner.timer.expired() => {
                inner.timer.reset();
                inner.start_election();
            }
            _ = shutdown_rx.recv() => {
                debug!(node = %inner.id, "election loop shutting down");
                break;
            }
        }
    }
}

/// Collect votes for `request` as they come back.
async fn solicit_votes(inner: Arc<Inner>, request: RequestVoteRequest, peers: Vec<NodeId>) {
    let deadline = inner.config.rpc_deadline();
    let mut pending: FuturesUnordered<_> = peers
        .into_iter()
        .map(|peer| {
            let inner = inner.clone();
            let request = request.clone();
            async move {
                let result = timeout(deadline, inner.transport.request_vote(&peer, request)).await;
                (peer, result)
            }
        })
        .collect();

    while let Some((peer, result)) = pending.next().await {
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(node = %inner.id, peer = %peer, error = %e, "vote request failed");
                continue;
            }
            Err(_) => {
                debug!(node = %inner.id, peer = %peer, "vote request timed out");
                continue;
            }
        };

        let mut shared = inner.shared.lock();
        if shared.stopped {
            return;
        }
        if let Err(e) = shared.node.handle_vote_response(&peer, &response) {
            error!(node = %inner.id, error = %e, "failed to record vote");
        }
        inner.reconcile(&mut shared);
        let node = &shared.node;
        if node.state() != NodeState::Candidate || node.current_term() != request.term {
            return;
        }
    }
}

/// Keep one peer in sync for the leadership `term`.
///
/// Sends whatever the peer is missing (or a heartbeat), retries right away
/// after a log mismatch, and otherwise sleeps until poked or the heartbeat
/// interval passes. Exits once the replica stops leading `term`.
async fn replicate_loop(inner: Arc<Inner>, peer: NodeId, term: Term, poke: Arc<Notify>) {
    loop {
        let request = {
            let shared = inner.shared.lock();
            if shared.stopped || !shared.node.is_leader() || shared.node.current_term() != term {
                return;
            }
            match shared.node.append_entries_for(&peer) {
                Ok(Some(request)) => Some(request),
                Ok(None) => return,
                Err(e) => {
                    error!(node = %inner.id, peer = %peer, error = %e, "could not build AppendEntries");
                    None
                }
            }
        };

        // a storage error skips this round; the heartbeat retries it
        let again = match request {
            Some(request) => send_append_entries(&inner, &peer, request).await,
            None => false,
        };
        if again {
            continue;
        }
        tokio::select! {
            _ = poke.notified() => {}
            _ = sleep(inner.config.heartbeat()) => {}
        }
    }
}

/// One AppendEntries round trip to `peer`. Returns whether the next batch
/// should go out without waiting.
async fn send_append_entries(
    inner: &Arc<Inner>,
    peer: &NodeId,
    request: AppendEntriesRequest,
) -> bool {
    let call = inner.transport.append_entries(peer, request.clone());
    let sent = timeout(inner.config.rpc_deadline(), call).await;
    let response = match sent {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(node = %inner.id, peer = %peer, error = %e, "AppendEntries failed");
            return false;
        }
        Err(_) => {
            debug!(node = %inner.id, peer = %peer, "AppendEntries timed out");
            return false;
        }
    };

    let mut shared = inner.shared.lock();
    if shared.stopped {
        return false;
    }
    match shared.node.handle_append_entries_response(peer, &request, &response) {
        Ok(true) => inner.apply_wake.notify_one(),
        Ok(false) => {}
        Err(e) => error!(node = %inner.id, peer = %peer, error = %e, "failed to record AppendEntries response"),
    }
    let pending = match shared.node.has_pending(peer) {
        Ok(pending) => pending,
        Err(e) => {
            error!(node = %inner.id, peer = %peer, error = %e, "could not read log tail");
            false
        }
    };
    inner.reconcile(&mut shared);
    !response.success || pending
}

/// Apply committed entries whenever the commit index moves. Entries left
/// behind by a storage error are retried every heartbeat interval.
async fn apply_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut behind = false;
    loop {
        tokio::select! {
            _ = inner.apply_wake.notified() => {}
            _ = sleep(inner.config.heartbeat()), if behind => {}
            _ = shutdown_rx.recv() => {
                debug!(node = %inner.id, "apply loop shutting down");
                break;
            }
        }
        behind = inner.apply_committed();
    }
}

/// Serve inbound RPCs until shutdown or the inbox closes.
async fn rpc_handler_loop(
    inner: Arc<Inner>,
    mut rpc_rx: RpcReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => match msg {
                Some(msg) => inner.handle_rpc(msg),
                None => {
                    debug!(node = %inner.id, "rpc channel closed, exiting handler loop");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!(node = %inner.id, "rpc handler loop shutting down");
                break;
            }
        }
    }
}
