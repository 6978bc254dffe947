//! # error
//!
//! why: one error type for everything that can fail inside a replica
//! relations: returned by node.rs, storage.rs and config.rs; surfaced by raft-server
//! what: RaftError and the crate-wide Result alias

use crate::log::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    /// This replica cannot serve the request; `leader` is the best guess.
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// A persistence read or write failed. The operation was not acknowledged.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// An outbound rpc failed or timed out.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The replica was stopped while the operation was in flight.
    #[error("replica shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
