//! Basic identifiers and index/term newtypes shared across the crate.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// A cluster identity, fixed for the lifetime of a cluster and learned by a
/// joining server on first contact (§3).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub Uuid);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A server identity, fixed for the lifetime of a single server instance (§3).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Raft term: a monotonically increasing epoch number (GLOSSARY).
pub type Term = u64;

/// A 1-based log index. Index 1 is always the sentinel preceding the first
/// real entry (§3 indexing convention).
pub type LogIndex = u64;

/// The index of the sentinel entry that precedes any real log entry.
pub const SENTINEL_INDEX: LogIndex = 1;

/// `(term, index)` pair used when comparing "how up to date" two logs are
/// (§4.4 vote granting) and to describe a position in the log.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPos {
    pub term: Term,
    pub index: LogIndex,
}

impl fmt::Display for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.index)
    }
}
