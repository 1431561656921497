//! The append-only record log collaborator, and the in-memory log/snapshot
//! store built on top of it (§4.1, §4.3, §6.1).
//!
//! The record log itself (framing, the `"OVSDB RAFT"` magic, fsync) is an
//! external collaborator: this module only defines the interface `RaftCore`
//! consumes, plus the virtual-base-index in-memory buffer described in
//! Design Note "Log as contiguous vector with virtual start".

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::ClusterId;
use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;
use crate::raft_types::Term;

/// The magic string that must prefix the record log file, per §6.1.
pub const LOG_MAGIC: &str = "OVSDB RAFT";

/// The set of servers as persisted in a `ServerConfig` entry or the
/// snapshot prefix: id maps to a dial address (`"tcp:host[:port]"` or
/// `"ssl:host[:port]"`, §3).
pub type ServerAddressMap = BTreeMap<ServerId, String>;

/// The payload carried by a single log entry (§3, §6.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque application bytes, never inspected by Raft.
    Data(Vec<u8>),
    /// A canonical serialization of the server set after a membership change.
    ServerConfig(ServerAddressMap),
}

/// A single entry in the replicated log (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

/// One body recorded in the on-disk log (§6.1). Framing (the magic header,
/// record boundaries) is provided by the record log collaborator; this is
/// only the logical content of a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// First record in the file, written exactly once.
    Header {
        cluster_id: uuid::Uuid,
        server_id: uuid::Uuid,
    },
    /// Second record in the file, written exactly once.
    Snapshot {
        prev_term: Term,
        prev_index: LogIndex,
        prev_servers: ServerAddressMap,
        data: Option<Vec<u8>>,
    },
    /// An appended log entry.
    Entry {
        term: Term,
        index: LogIndex,
        payload: EntryPayload,
    },
    /// A term/vote durability record.
    State { term: Term, vote: Option<ServerId> },
}

impl Record {
    /// Serialize this record as a single JSON line, the wire format the
    /// on-disk log actually uses once the `"OVSDB RAFT"` magic header has
    /// been written (§6.1).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one line previously produced by `to_json_line`.
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// The append-only record log interface `RaftCore` consumes (§4.1).
///
/// Implementations provide framed, ordered, durable storage; they do not
/// interpret record contents beyond what is needed for truncation and
/// replace/rewrite. `commit` performs (or schedules — see the fsync worker
/// in `core::durability`) an fsync of everything appended so far.
pub trait RecordLog: Send + 'static {
    /// Read the next record in file order, or `None` at end of file.
    ///
    /// A trailing truncated record is tolerated: implementations return
    /// `Ok(None)` for it after logging a warning (§6.1).
    fn read_next_record(&mut self) -> anyhow::Result<Option<Record>>;

    /// Append a new record. Not yet durable until `commit` completes.
    fn append_record(&mut self, record: &Record) -> anyhow::Result<()>;

    /// Fsync everything appended so far.
    fn commit(&mut self) -> anyhow::Result<()>;

    /// Begin rewriting the log with a new snapshot prefix, e.g. during
    /// snapshot installation or local log compaction. The header and
    /// snapshot records must be rewritten before any residual log entries.
    fn replace_start(&mut self, header: &Record, snapshot: &Record) -> anyhow::Result<()>;

    /// Commit a replace operation: fsync and atomically swap in the new file.
    fn replace_commit(&mut self) -> anyhow::Result<()>;

    /// Abort a replace operation in progress, leaving the original file intact.
    fn replace_abort(&mut self) -> anyhow::Result<()>;
}

/// The in-memory log: entries `[log_start, log_end)`, plus the snapshot
/// prefix summarizing everything before `log_start` (§3).
///
/// `entry(i)` is `buffer[i - log_start]`; head-discard on snapshot install
/// is a drain from the front, tail-discard on truncation is a truncate.
#[derive(Debug, Clone)]
pub struct LogStore {
    log_start: LogIndex,
    buffer: Vec<LogEntry>,
    pub prev_term: Term,
    pub prev_servers: ServerAddressMap,
    pub snapshot_data: Option<Vec<u8>>,
}

impl LogStore {
    /// A freshly created cluster starts with `log_start = log_end = 2`
    /// (index 1 is the sentinel, §3).
    pub fn new_empty(prev_servers: ServerAddressMap, snapshot_data: Option<Vec<u8>>) -> Self {
        Self {
            log_start: 2,
            buffer: Vec::new(),
            prev_term: 0,
            prev_servers,
            snapshot_data,
        }
    }

    /// Reconstruct from a known prefix (used during replay / snapshot install).
    pub fn from_prefix(
        log_start: LogIndex,
        prev_term: Term,
        prev_servers: ServerAddressMap,
        snapshot_data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            log_start,
            buffer: Vec::new(),
            prev_term,
            prev_servers,
            snapshot_data,
        }
    }

    pub fn log_start(&self) -> LogIndex {
        self.log_start
    }

    pub fn log_end(&self) -> LogIndex {
        self.log_start + self.buffer.len() as LogIndex
    }

    pub fn prev_index(&self) -> LogIndex {
        self.log_start - 1
    }

    /// The term at `prev_index`, i.e. `prev_term`.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.prev_index() {
            return Some(self.prev_term);
        }
        if index < self.log_start || index >= self.log_end() {
            return None;
        }
        Some(self.buffer[(index - self.log_start) as usize].term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.log_start || index >= self.log_end() {
            return None;
        }
        Some(&self.buffer[(index - self.log_start) as usize])
    }

    pub fn entries(&self, start: LogIndex, end: LogIndex) -> &[LogEntry] {
        let lo = start.max(self.log_start);
        let hi = end.min(self.log_end());
        if lo >= hi {
            return &[];
        }
        let lo_off = (lo - self.log_start) as usize;
        let hi_off = (hi - self.log_start) as usize;
        &self.buffer[lo_off..hi_off]
    }

    /// Append a single entry at `log_end`.
    pub fn append(&mut self, entry: LogEntry) {
        self.buffer.push(entry);
    }

    /// Truncate the log so that `log_end` becomes `index`, discarding any
    /// uncommitted tail (only ever done by candidates/followers, §3 invariant 4).
    pub fn truncate_to(&mut self, index: LogIndex) {
        if index <= self.log_start {
            self.buffer.clear();
            return;
        }
        if index >= self.log_end() {
            return;
        }
        let keep = (index - self.log_start) as usize;
        self.buffer.truncate(keep);
    }

    /// Discard the prefix up to and including `new_prev_index`, shifting
    /// `log_start` forward (used during snapshot install, §4.8).
    pub fn shift_start(&mut self, new_prev_index: LogIndex, new_prev_term: Term) {
        if new_prev_index >= self.log_end() {
            self.buffer.clear();
            self.log_start = new_prev_index + 1;
        } else if new_prev_index >= self.log_start {
            let drop = (new_prev_index + 1 - self.log_start) as usize;
            self.buffer.drain(..drop);
            self.log_start = new_prev_index + 1;
        }
        self.prev_term = new_prev_term;
    }

    pub fn last_log_pos(&self) -> (Term, LogIndex) {
        let idx = self.log_end() - 1;
        (self.term_at(idx).unwrap_or(self.prev_term), idx)
    }
}

/// Durable state reconstructed from an existing log file on startup (§4.9
/// crash-recovery, §6.1 replay rules). `None` means the file held no
/// records at all yet (a freshly `create`d file before the first write).
pub struct ReplayedState {
    pub cluster_id: ClusterId,
    pub server_id: ServerId,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: LogStore,
    /// `prev_index`: everything up to and including this is already
    /// committed by virtue of having been snapshotted (§3 invariant 6).
    pub prev_index: LogIndex,
}

/// Read every record in `log` and reconstruct the durable state it encodes
/// (§4.9, §6.1's replay rules). Does not append or commit anything; the
/// caller hands the now-positioned-at-EOF log to the fsync worker
/// afterwards so further appends continue where replay left off.
pub fn replay<L: RecordLog>(log: &mut L) -> anyhow::Result<Option<ReplayedState>> {
    let (cluster_id, server_id) = match log.read_next_record()? {
        Some(Record::Header { cluster_id, server_id }) => (ClusterId(cluster_id), ServerId(server_id)),
        Some(other) => anyhow::bail!("expected header record first, found {:?}", other),
        None => return Ok(None),
    };
    let (prev_term, prev_index, prev_servers, data) = match log.read_next_record()? {
        Some(Record::Snapshot {
            prev_term,
            prev_index,
            prev_servers,
            data,
        }) => (prev_term, prev_index, prev_servers, data),
        Some(other) => anyhow::bail!("expected snapshot record second, found {:?}", other),
        None => anyhow::bail!("log file has a header but no snapshot record"),
    };

    let mut log_store = LogStore::from_prefix(prev_index + 1, prev_term, prev_servers, data);
    let mut current_term = prev_term;
    let mut voted_for = None;

    // A trailing truncated/partial record is surfaced by `read_next_record`
    // returning `Ok(None)` early (§6.1): replay simply stops there.
    while let Some(record) = log.read_next_record()? {
        match record {
            Record::Entry { term, index, payload } => {
                if term > current_term {
                    current_term = term;
                    voted_for = None;
                }
                if index == log_store.log_end() {
                    log_store.append(LogEntry { term, payload });
                } else if index >= log_store.log_start() && index < log_store.log_end() {
                    log_store.truncate_to(index);
                    log_store.append(LogEntry { term, payload });
                } else {
                    tracing::warn!(index, log_end = log_store.log_end(), "skipping out-of-range entry record during replay");
                }
            }
            Record::State { term, vote } => {
                if term > current_term {
                    current_term = term;
                    voted_for = vote;
                } else if term == current_term {
                    if let (Some(existing), Some(new)) = (voted_for, vote) {
                        if existing != new {
                            anyhow::bail!("conflicting votes for term {term} found in replay: {existing} and {new}");
                        }
                    }
                    if vote.is_some() {
                        voted_for = vote;
                    }
                }
                // A `State` record with a lower term than already observed is
                // stale (superseded by a later term-advance record) and ignored.
            }
            Record::Header { .. } | Record::Snapshot { .. } => {
                tracing::warn!("unexpected header/snapshot record mid-file during replay, ignoring");
            }
        }
    }

    Ok(Some(ReplayedState {
        cluster_id,
        server_id,
        current_term,
        voted_for,
        log: log_store,
        prev_index,
    }))
}
