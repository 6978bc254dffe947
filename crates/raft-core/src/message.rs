//! # message
//!
//! why: define the rpc messages exchanged between replicas and with clients
//! relations: built and consumed by node.rs, carried by the transport in raft-server
//! what: RequestVote, AppendEntries, ClientRequest and ClientResponse payloads

use crate::log::{Command, LogEntry, LogIndex, NodeId, Operation, Term};
use serde::{Deserialize, Serialize};

/// Sent by a candidate to every peer when it starts an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The voter's current term, so a stale candidate can step down
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicates log entries; with no entries it is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request covers once accepted.
    pub fn last_covered_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The follower's current term, so a stale leader can step down
    pub term: Term,
    pub success: bool,
    /// On a log mismatch, the index the leader should retry from
    #[serde(default)]
    pub conflict_index: Option<LogIndex>,
}

/// A client operation. Idempotent per `(client_id, client_serial)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: String,
    pub client_serial: u64,
    pub operation: Operation,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl ClientRequest {
    pub fn into_command(self) -> Command {
        Command {
            client_id: self.client_id,
            client_serial: self.client_serial,
            operation: self.operation,
            key: self.key,
            value: self.value,
        }
    }
}

impl From<Command> for ClientRequest {
    fn from(command: Command) -> Self {
        Self {
            client_id: command.client_id,
            client_serial: command.client_serial,
            operation: command.operation,
            key: command.key,
            value: command.value,
        }
    }
}

/// Either a redirect (every other field is ignored) or a completed result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// The request was not executed here; retry elsewhere
    #[serde(default)]
    pub redirected: bool,
    /// Best-known leader to retry against, if any
    #[serde(default)]
    pub redirect_to: Option<NodeId>,
    pub client_serial: u64,
    pub successful: bool,
    pub result: String,
}

impl ClientResponse {
    /// A redirect to `leader`, or to nobody when the leader is unknown.
    pub fn redirect(leader: Option<NodeId>) -> Self {
        Self {
            redirected: true,
            redirect_to: leader,
            ..Self::default()
        }
    }

    pub fn completed(client_serial: u64, successful: bool, result: impl Into<String>) -> Self {
        Self {
            redirected: false,
            redirect_to: None,
            client_serial,
            successful,
            result: result.into(),
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirected
    }
}
