//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: persisted through raft-storage, driven over the network by raft-server
//! what: replica role machine, election and replication handlers, commit advancement,
//!       apply pipeline with client deduplication, key/value state machine

pub mod config;
pub mod dedup;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;

pub use config::RaftConfig;
pub use dedup::DedupCache;
pub use error::{RaftError, Result};
pub use log::{Command, LogEntry, LogIndex, NodeId, Operation, Term};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientRequest, ClientResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use node::{AppliedEntry, NodeState, PeerProgress, Proposal, RaftNode};
pub use state_machine::KvStore;
pub use storage::{InMemoryStorage, Storage};
