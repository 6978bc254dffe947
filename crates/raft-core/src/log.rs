//! # log
//!
//! why: describe the entries of the replicated log and the commands they carry
//! relations: produced by node.rs on the leader, persisted via storage.rs, applied by state_machine.rs
//! what: Term/LogIndex/NodeId aliases, Operation, Command, LogEntry

use serde::{Deserialize, Serialize};
use std::fmt;

/// Election epoch. Starts at 0 and only ever grows.
pub type Term = u64;

/// Position in the log. Entries are 1-indexed; 0 means "before the first entry".
pub type LogIndex = u64;

/// Identity of a replica (its name or address, used verbatim in redirects).
pub type NodeId = String;

/// The key/value operation a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    Put,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A client command as it travels through the log.
///
/// `(client_id, client_serial)` identifies the request for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub client_id: String,
    pub client_serial: u64,
    pub operation: Operation,
    pub key: String,
    pub value: String,
}

impl Command {
    pub fn get(client_id: impl Into<String>, client_serial: u64, key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_serial,
            operation: Operation::Get,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn put(
        client_id: impl Into<String>,
        client_serial: u64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_serial,
            operation: Operation::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(client_id: impl Into<String>, client_serial: u64, key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_serial,
            operation: Operation::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

/// A single entry in the replicated log.
///
/// Immutable once appended. Only uncommitted entries at the tail of a
/// follower's log are ever replaced, and only by the leader's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The position of this entry (1-indexed)
    pub index: LogIndex,
    /// The term in which the leader created this entry
    pub term: Term,
    /// The client command to apply once committed
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command) -> Self {
        Self { index, term, command }
    }
}

/// Returns true when the log ending at `(index, term)` is at least as
/// up-to-date as the log ending at `(our_index, our_term)`.
///
/// Terms are compared first; lengths only break ties.
pub fn is_up_to_date(index: LogIndex, term: Term, our_index: LogIndex, our_term: Term) -> bool {
    term > our_term || (term == our_term && index >= our_index)
}
