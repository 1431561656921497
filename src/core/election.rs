//! Election timer and vote-granting logic (§4.4).

use std::time::Duration;
use std::time::Instant;

use crate::raft_types::LogIndex;
use crate::raft_types::Term;

/// Whether `(candidate_term, candidate_index)` is at least as up to date as
/// `(voter_term, voter_index)`, per the standard Raft comparison: higher
/// term wins outright, equal term compares index (§4.4).
pub fn log_is_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    voter_last_term: Term,
    voter_last_index: LogIndex,
) -> bool {
    match candidate_last_term.cmp(&voter_last_term) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate_last_index >= voter_last_index,
    }
}

/// Tracks the next election-timeout deadline and whether it has been reset
/// by recent leader contact.
pub struct ElectionTimer {
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(initial_timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + initial_timeout,
        }
    }

    /// Reset the timer to fire `timeout` from now, e.g. on receiving a valid
    /// AppendRequest/InstallSnapshot from the current leader, or granting a
    /// vote (§4.4).
    pub fn reset(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_term_is_more_up_to_date() {
        assert!(log_is_up_to_date(5, 1, 4, 100));
    }

    #[test]
    fn equal_term_compares_index() {
        assert!(log_is_up_to_date(5, 10, 5, 9));
        assert!(!log_is_up_to_date(5, 8, 5, 9));
    }

    #[test]
    fn lower_term_never_up_to_date() {
        assert!(!log_is_up_to_date(4, 1000, 5, 1));
    }
}
