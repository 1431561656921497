//! The application state machine collaborator (§4.1, out of scope to
//! implement: only the interface `RaftCore` drives is defined here).

use async_trait::async_trait;

use crate::raft_types::LogIndex;

/// Applies committed log entries in order and answers snapshot requests.
///
/// `RaftCore` calls `apply` once per committed `Data` entry, strictly in
/// index order and never more than once for a given index (§4.1).
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply the entry at `index` with payload `data`.
    async fn apply(&self, index: LogIndex, data: &[u8]);

    /// Produce a full snapshot of current state, to be installed as the new
    /// log prefix (§4.8, local compaction).
    async fn snapshot(&self) -> Vec<u8>;

    /// Discard all applied state and reset to what `data` describes, used
    /// when this server receives an `InstallSnapshot` stream (§4.8).
    async fn restore(&self, data: &[u8]);
}
