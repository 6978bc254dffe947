//! # storage
//!
//! why: the narrow persistence interface the replica core depends on
//! relations: consumed by node.rs, implemented durably by raft-storage's FileStorage
//! what: Storage trait, InMemoryStorage for tests and embedding

use crate::log::{LogEntry, LogIndex, NodeId, Term};
use std::io;

/// trait for durable storage of raft state
///
/// every write must be durable when it returns `Ok`; the node only updates
/// its in-memory view (and only answers rpcs) after a write has succeeded.
pub trait Storage: Send {
    /// load the persisted term and vote (0 and none for a fresh replica)
    fn load_state(&self) -> io::Result<(Term, Option<NodeId>)>;

    /// persist term and vote together as one record
    fn save_state(&mut self, term: Term, voted_for: Option<&NodeId>) -> io::Result<()>;

    /// true when the log holds an entry at `index` created in `term`
    fn verify_entry_at(&self, index: LogIndex, term: Term) -> io::Result<bool>;

    /// index and term of the last entry, or none for an empty log
    fn last_entry(&self) -> io::Result<Option<(LogIndex, Term)>>;

    /// entries in `[from, to)`, ordered by index
    fn read_entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>>;

    /// drop every entry at or after the first given index, then append all
    /// given entries in order, as one atomic step
    fn save_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// term of the entry at `index`, if present
    fn term_at(&self, index: LogIndex) -> io::Result<Option<Term>> {
        Ok(self
            .read_entries(index, index + 1)?
            .first()
            .map(|entry| entry.term))
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn load_state(&self) -> io::Result<(Term, Option<NodeId>)> {
        (**self).load_state()
    }

    fn save_state(&mut self, term: Term, voted_for: Option<&NodeId>) -> io::Result<()> {
        (**self).save_state(term, voted_for)
    }

    fn verify_entry_at(&self, index: LogIndex, term: Term) -> io::Result<bool> {
        (**self).verify_entry_at(index, term)
    }

    fn last_entry(&self) -> io::Result<Option<(LogIndex, Term)>> {
        (**self).last_entry()
    }

    fn read_entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>> {
        (**self).read_entries(from, to)
    }

    fn save_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        (**self).save_entries(entries)
    }

    fn term_at(&self, index: LogIndex) -> io::Result<Option<Term>> {
        (**self).term_at(index)
    }
}

/// check that a batch is contiguous and starts at a position the log can
/// accept (no gap after the current tail)
pub fn check_batch(entries: &[LogEntry], last_index: LogIndex) -> io::Result<()> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    if first.index == 0 || first.index > last_index + 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("batch starting at {} would leave a gap after {}", first.index, last_index),
        ));
    }
    for pair in entries.windows(2) {
        if pair[1].index != pair[0].index + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("batch is not contiguous at {}", pair[1].index),
            ));
        }
    }
    Ok(())
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// create a storage whose log already holds `entries`
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            log: entries,
            ..Self::default()
        }
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        // entries are contiguous from 1, so index n sits at slot n - 1
        let slot = index.checked_sub(1)? as usize;
        (slot < self.log.len()).then_some(slot)
    }
}

impl Storage for InMemoryStorage {
    fn load_state(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn save_state(&mut self, term: Term, voted_for: Option<&NodeId>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for.cloned();
        Ok(())
    }

    fn verify_entry_at(&self, index: LogIndex, term: Term) -> io::Result<bool> {
        Ok(self
            .position(index)
            .map_or(false, |slot| self.log[slot].term == term))
    }

    fn last_entry(&self) -> io::Result<Option<(LogIndex, Term)>> {
        Ok(self.log.last().map(|e| (e.index, e.term)))
    }

    fn read_entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>> {
        Ok(self
            .log
            .iter()
            .filter(|e| e.index >= from && e.index < to)
            .cloned()
            .collect())
    }

    fn save_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let last = self.log.last().map_or(0, |e| e.index);
        check_batch(entries, last)?;
        if let Some(first) = entries.first() {
            self.log.retain(|e| e.index < first.index);
            self.log.extend(entries.iter().cloned());
        }
        Ok(())
    }
}
