//! Error types returned by the Raft core and its collaborators (§7).

use crate::raft_types::ClusterId;
use crate::raft_types::ServerId;

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors surfaced from the protocol core itself.
///
/// `RaftStorage`/`RaftNetwork`/`RaftLog` failures are wrapped with
/// `anyhow::Error` rather than given their own variant tree, matching the
/// teacher's treatment of storage errors in `RaftError::RaftStorage`.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("fatal error from the record log: {0}")]
    Log(#[from] anyhow::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("the raft node is shutting down")]
    ShuttingDown,
}

/// Malformed persisted record or wire message (§7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyntaxError {
    #[error("record log is missing its header record")]
    MissingHeader,
    #[error("record log is missing its snapshot record")]
    MissingSnapshot,
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("malformed wire message: {0}")]
    MalformedMessage(String),
    #[error("log entry at index {index} specifies term {term} older than a preceding entry")]
    NonMonotonicTerm { index: u64, term: u64 },
    #[error("conflicting vote recorded twice within term {term}")]
    ConflictingVote { term: u64 },
}

/// Protocol-level errors: misrouting, cluster mismatch, double voting (§7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("message addressed to cluster {got} but this server belongs to cluster {expected}")]
    ClusterMismatch { expected: ClusterId, got: ClusterId },

    #[error("message addressed to server {got} but this server is {expected}")]
    Misrouted { expected: ServerId, got: ServerId },

    #[error("server {server} voted for two different candidates in term {term}")]
    DoubleVote { server: ServerId, term: u64 },
}

/// Operating on a server or log in a state that does not permit the request (§7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("record log at {0} is not fully initialized")]
    LogNotInitialized(String),

    #[error("server {0} is not a configured member of this cluster")]
    NotAMember(ServerId),

    #[error("a reconfiguration is already in progress")]
    ReconfigurationInProgress,
}

/// The lifecycle states (and terminal user-visible failures) of a submitted
/// command (§7, §4.6).
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CommandStatus {
    /// Still being replicated; not yet committed.
    Incomplete,
    /// Committed and applied.
    Success,
    /// This server is not the leader.
    NotLeader,
    /// Leadership was lost before the command committed.
    LostLeadership,
    /// The Raft node was shut down before the command committed.
    Shutdown,
}

/// The outcome of an AddServer/RemoveServer request (§4.7, §6.2).
///
/// Field names mirror the exact wire strings of §6.2's status enum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerOpStatus {
    NotLeader,
    NoOp,
    InProgress,
    Timeout,
    LostLeadership,
    Canceled,
    Committing,
    Empty,
    Success,
}
