//! Observable metrics for a running Raft node.
//!
//! This is ambient instrumentation, not protocol behavior: nothing here
//! feeds back into `RaftCore`'s decisions.

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::timeout as tokio_timeout;

use crate::raft_types::ClusterId;
use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;
use crate::raft_types::Term;
use crate::core::State;

/// A point-in-time snapshot of a Raft node's state, published after every
/// state transition and every commit-index advance.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftMetrics {
    pub id: ServerId,
    pub cluster_id: Option<ClusterId>,
    pub state: State,
    pub current_term: Term,
    pub last_log_index: LogIndex,
    pub last_applied: LogIndex,
    pub current_leader: Option<ServerId>,
    pub leader_metrics: Option<LeaderMetrics>,
    /// Mirrors `RaftCore`'s `joining` flag: true until this server's own
    /// `ServerConfig` membership entry has committed (§9 Design Note).
    pub joining: bool,
}

impl RaftMetrics {
    pub fn new_initial(id: ServerId) -> Self {
        Self {
            id,
            cluster_id: None,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            leader_metrics: None,
            joining: true,
        }
    }
}

/// Leader-only metrics: the replicated position known for each peer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<ServerId, LogIndex>,
}

/// A handle for blocking (with a timeout) until the metrics stream satisfies
/// some predicate. Grounded in the teacher's `Wait` helper.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the given predicate holds, or the timeout elapses.
    pub async fn metrics<T>(&mut self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            let cur = self.rx.borrow().clone();
            if func(&cur) {
                return Ok(cur);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WaitError::Timeout(msg.to_string()));
            }
            match tokio_timeout(remaining, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ChannelClosed),
                Err(_) => return Err(WaitError::Timeout(msg.to_string())),
            }
        }
    }

    /// Wait for the node to report the given state.
    pub async fn state(&mut self, want: State) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, "state").await
    }

    /// Wait for `last_applied` to reach at least `index`.
    pub async fn applied_index(&mut self, index: LogIndex) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= index, "applied_index").await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("metrics channel closed")]
    ChannelClosed,
}
