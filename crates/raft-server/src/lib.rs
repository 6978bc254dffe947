//! # raft-server
//!
//! why: run raft-core replicas as concurrent tasks that talk over a network
//! relations: drives raft-core's RaftNode, persists through any raft-core Storage (e.g. raft-storage)
//! what: Replica runtime, election timer, Transport trait with an in-process network

pub mod replica;
pub mod timer;
pub mod transport;

pub use replica::{Replica, ReplicaStatus};
pub use timer::ElectionTimer;
pub use transport::{
    InMemoryNetwork, InMemoryTransport, RpcMessage, RpcReceiver, RpcSender, Transport,
};
