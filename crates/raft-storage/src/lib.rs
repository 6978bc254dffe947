//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's Storage trait, handed to the raft-server runtime
//! what: FileStorage, a directory holding meta.json and log.json

use raft_core::storage::check_batch;
use raft_core::{LogEntry, LogIndex, NodeId, Storage, Term};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for
/// - log.json: array of log entries
///
/// both files are read once on open and mirrored in memory. every write
/// goes to a temp file, is fsynced, then renamed over the original; the
/// in-memory copy only changes after the rename succeeds.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    meta: MetaData,
    log: Vec<LogEntry>,
}

impl FileStorage {
    /// open (or create) storage at the given directory
    ///
    /// creates the directory if it doesn't exist and loads whatever a
    /// previous run left behind
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta: MetaData = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let log: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        check_batch(&log, 0)?;

        debug!(dir = %dir.display(), term = meta.term, entries = log.len(), "opened file storage");
        Ok(Self { dir, meta, log })
    }

    /// directory this storage lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_log(&self, log: &[LogEntry]) -> io::Result<()> {
        write_json_atomic(&self.dir, LOG_FILE, &log)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let slot = index.checked_sub(1)? as usize;
        (slot < self.log.len()).then_some(slot)
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

/// read and parse a json file, `None` if it does not exist yet
fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// atomic write: write to temp file, sync, then rename
fn write_json_atomic<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;

    Ok(())
}

impl Storage for FileStorage {
    fn load_state(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok((self.meta.term, self.meta.voted_for.clone()))
    }

    fn save_state(&mut self, term: Term, voted_for: Option<&NodeId>) -> io::Result<()> {
        let meta = MetaData {
            term,
            voted_for: voted_for.cloned(),
        };
        write_json_atomic(&self.dir, META_FILE, &meta)?;
        self.meta = meta;
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
        let start = from.max(1);
        if to <= start {
            return Ok(Vec::new());
        }
        let lo = (start - 1) as usize;
        let hi = ((to - 1) as usize).min(self.log.len());
        Ok(self.log.get(lo..hi).map(<[LogEntry]>::to_vec).unwrap_or_default())
    }

    fn save_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let last = self.log.last().map_or(0, |e| e.index);
        check_batch(entries, last)?;

        // everything from the first new index on is replaced
        let keep = (first.index - 1) as usize;
        let mut log = self.log[..keep.min(self.log.len())].to_vec();
        log.extend_from_slice(entries);
        self.write_log(&log)?;

        if keep < self.log.len() {
            debug!(from = first.index, dropped = self.log.len() - keep, "truncated log suffix");
        }
        self.log = log;
        Ok(())
    }

    fn term_at(&self, index: LogIndex) -> io::Result<Option<Term>> {
        Ok(self.position(index).map(|slot| self.log[slot].term))
    }
}
