//! Per-peer replication bookkeeping and the commit-index advance rule
//! (§4.5).
//!
//! There is no spawned task per peer: every peer's `next_index`/`match_index`
//! is a plain record owned by `RaftCore` and driven from the single event
//! loop's `tokio::select!` (heartbeats fire off a timer per peer, replies
//! update the record in place).

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;
use crate::raft_types::Term;

/// Leader's view of one follower's replication progress.
#[derive(Clone, Debug)]
pub struct PeerProgress {
    /// Index of the next entry to send this peer.
    pub next_index: LogIndex,
    /// Highest index known to be present in this peer's log.
    pub match_index: LogIndex,
    pub last_sent_at: Option<Instant>,
    /// Set while an AppendRequest to this peer is outstanding, to avoid
    /// piling up retries ahead of a reply (single-in-flight per peer, §9
    /// Non-goals: no pipelining).
    pub in_flight: bool,
}

impl PeerProgress {
    pub fn new(leader_log_end: LogIndex) -> Self {
        Self {
            next_index: leader_log_end,
            match_index: 0,
            last_sent_at: None,
            in_flight: false,
        }
    }

    pub fn due_for_heartbeat(&self, now: Instant, heartbeat_interval: Duration) -> bool {
        match self.last_sent_at {
            None => true,
            Some(t) => now.duration_since(t) >= heartbeat_interval,
        }
    }

    /// Apply a successful AppendReply: advance `match_index` and `next_index`.
    pub fn on_success(&mut self, sent_up_to: LogIndex) {
        self.match_index = self.match_index.max(sent_up_to);
        self.next_index = self.next_index.max(sent_up_to + 1);
        self.in_flight = false;
    }

    /// Apply a rejected AppendReply: rewind `next_index` to whichever is
    /// smaller, a plain one-at-a-time decrement or the peer's reported
    /// `log_end` (§4.5 fast-rewind). Taking the peer's `log_end` unguarded
    /// can *increase* `next_index` when the peer's log is longer than what
    /// we just sent (a stale/conflicting tail after a leader change), which
    /// would never converge.
    pub fn on_rejected(&mut self, peer_log_end: LogIndex) {
        let one_back = self.next_index.saturating_sub(1);
        self.next_index = one_back.min(peer_log_end).max(1);
        self.in_flight = false;
    }
}

/// Leader-side table of every configured peer's progress.
#[derive(Default)]
pub struct ReplicationTable {
    peers: BTreeMap<ServerId, PeerProgress>,
}

impl ReplicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_for(&mut self, ids: impl IntoIterator<Item = ServerId>, leader_log_end: LogIndex) {
        self.peers.clear();
        for id in ids {
            self.peers.insert(id, PeerProgress::new(leader_log_end));
        }
    }

    pub fn insert(&mut self, id: ServerId, leader_log_end: LogIndex) {
        self.peers.entry(id).or_insert_with(|| PeerProgress::new(leader_log_end));
    }

    pub fn remove(&mut self, id: ServerId) {
        self.peers.remove(&id);
    }

    pub fn get(&self, id: ServerId) -> Option<&PeerProgress> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut PeerProgress> {
        self.peers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &PeerProgress)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ServerId, &mut PeerProgress)> {
        self.peers.iter_mut()
    }

    /// The match_index that a majority of `voters` (including the leader
    /// itself via `self_match_index`) have reached (§4.5 commit rule).
    pub fn majority_match_index(
        &self,
        voters: &[ServerId],
        self_match_index: LogIndex,
    ) -> LogIndex {
        let mut indices: Vec<LogIndex> = voters
            .iter()
            .map(|id| {
                if self.peers.contains_key(id) {
                    self.peers[id].match_index
                } else {
                    self_match_index
                }
            })
            .collect();
        if indices.is_empty() {
            return self_match_index;
        }
        indices.sort_unstable();
        let majority_rank = (indices.len() - 1) / 2;
        indices[indices.len() - 1 - majority_rank]
    }
}

/// Whether `candidate_index` may become the new `commit_index`: it must be
/// reachable by a majority AND its entry must have been proposed in the
/// leader's current term (§4.5: a leader never directly commits an entry
/// from an earlier term, only transitively via a later-term entry covering it).
pub fn can_advance_commit(
    candidate_index: LogIndex,
    candidate_term: Term,
    current_term: Term,
) -> bool {
    candidate_index > 0 && candidate_term == current_term
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_match_index_picks_median() {
        let mut table = ReplicationTable::new();
        let a = ServerId::new();
        let b = ServerId::new();
        table.reset_for(vec![a, b], 1);
        table.get_mut(a).unwrap().match_index = 10;
        table.get_mut(b).unwrap().match_index = 5;
        // voters: leader(self) + a + b, self_match_index = 20
        let idx = table.majority_match_index(&[a, b], 20);
        assert_eq!(idx, 10);
    }

    #[test]
    fn commit_requires_current_term() {
        assert!(!can_advance_commit(5, 3, 4));
        assert!(can_advance_commit(5, 4, 4));
    }
}
