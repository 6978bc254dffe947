//! # transport
//!
//! why: decouple the replica runtime from how RPCs actually travel
//! relations: replica.rs sends through Transport and serves RpcMessages from its inbox
//! what: Transport trait, RpcMessage envelope, InMemoryNetwork + InMemoryTransport

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RaftError, RequestVoteRequest,
    RequestVoteResponse, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Outbound RPCs a replica sends to its peers.
///
/// A failed call (unreachable peer, dropped reply) is a `RaftError::Transport`;
/// callers retry on their own schedule.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// An inbound RPC together with the channel its answer goes back on.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

const INBOX_CAPACITY: usize = 256;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, RpcSender>,
    crashed: HashSet<NodeId>,
}

/// In-process network connecting replicas through channels.
///
/// A crashed replica is cut off in both directions: nothing reaches it and
/// nothing it sends arrives. Its tasks keep running, which is how tests model
/// a partitioned leader.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the inbox for `id` and return its receiving end.
    pub fn register(&self, id: impl Into<NodeId>) -> RpcReceiver {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.state.write().inboxes.insert(id.into(), tx);
        rx
    }

    /// A transport that sends on behalf of `local_id`.
    pub fn transport(&self, local_id: impl Into<NodeId>) -> InMemoryTransport {
        InMemoryTransport {
            local_id: local_id.into(),
            network: self.clone(),
        }
    }

    pub fn crash(&self, id: &str) {
        tracing::info!(node = id, "network: node cut off");
        self.state.write().crashed.insert(id.to_string());
    }

    pub fn restore(&self, id: &str) {
        tracing::info!(node = id, "network: node reconnected");
        self.state.write().crashed.remove(id);
    }

    pub fn is_crashed(&self, id: &str) -> bool {
        self.state.read().crashed.contains(id)
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<RpcSender> {
        let state = self.state.read();
        if state.crashed.contains(from) || state.crashed.contains(to) {
            return Err(RaftError::Transport {
                reason: format!("{from} -> {to}: link down"),
            });
        }
        state.inboxes.get(to).cloned().ok_or_else(|| RaftError::Transport {
            reason: format!("peer not found: {to}"),
        })
    }
}

/// Per-replica handle onto an `InMemoryNetwork`.
#[derive(Clone)]
pub struct InMemoryTransport {
    local_id: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    async fn call<T: Send>(
        &self,
        target: &NodeId,
        envelope: impl FnOnce(oneshot::Sender<T>) -> RpcMessage + Send,
    ) -> Result<T> {
        let peer = self.network.route(&self.local_id, target)?;

        let (response_tx, response_rx) = oneshot::channel();
        peer.send(envelope(response_tx))
            .await
            .map_err(|e| RaftError::Transport {
                reason: format!("{target}: {e}"),
            })?;

        let response = response_rx.await.map_err(|_| RaftError::Transport {
            reason: format!("{target}: no response"),
        })?;

        // the link may have gone down while the request was in flight
        self.network.route(target, &self.local_id)?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(target, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }
}
