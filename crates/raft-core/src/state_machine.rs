//! # state_machine
//!
//! why: the deterministic key/value store that committed commands are applied to
//! relations: driven by node.rs's apply pipeline, one entry at a time in log order
//! what: KvStore and its get/put/delete semantics

use crate::log::{Command, Operation};
use std::collections::BTreeMap;

/// Outcome of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub successful: bool,
    pub result: String,
}

/// In-memory key/value data replicated by the log.
///
/// Owned by a single `RaftNode`, so it needs no locking of its own. BTreeMap
/// keeps iteration deterministic for snapshots in tests.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute a command.
    ///
    /// - get: successful when the key exists, result is the value
    /// - put: always successful, result is empty
    /// - delete: successful when the key existed, result is empty
    pub fn apply(&mut self, command: &Command) -> Applied {
        match command.operation {
            Operation::Get => match self.data.get(&command.key) {
                Some(value) => Applied {
                    successful: true,
                    result: value.clone(),
                },
                None => Applied {
                    successful: false,
                    result: String::new(),
                },
            },
            Operation::Put => {
                self.data.insert(command.key.clone(), command.value.clone());
                Applied {
                    successful: true,
                    result: String::new(),
                }
            }
            Operation::Delete => Applied {
                successful: self.data.remove(&command.key).is_some(),
                result: String::new(),
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
