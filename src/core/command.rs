//! The command tracker: an id-indexed handle table owned by `RaftCore`
//! (§4.6, Design Note).
//!
//! Rather than embedding the caller's reply channel in the log entry itself
//! (as a ref-counted `Arc`), a submitted command is assigned an opaque id;
//! `RaftCore` alone owns the authoritative record (its log index, current
//! status, and reply channel), and the caller is only ever given a handle
//! that looks the record up by id. This keeps the log entry type free of
//! any caller-visible plumbing and makes it trivial to fail every
//! outstanding command in one pass on a role change.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::CommandStatus;
use crate::raft_types::LogIndex;
use crate::raft_types::Term;

/// Opaque identifier for a submitted command, valid only within the process
/// that submitted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandId(u64);

/// The authoritative record for one submitted-but-not-yet-resolved command.
struct Tracked {
    log_index: LogIndex,
    term: Term,
    reply: Option<oneshot::Sender<CommandStatus>>,
}

/// Owns every in-flight command submitted on this server while it has been
/// leader (§4.6).
#[derive(Default)]
pub struct CommandTracker {
    next_id: u64,
    by_id: HashMap<CommandId, Tracked>,
    /// Index into `by_id` by log index, so a commit-index advance can
    /// resolve every command up to the new commit index in one pass.
    by_index: std::collections::BTreeMap<LogIndex, CommandId>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly appended command, returning its id and a receiver
    /// the caller awaits for the final status.
    pub fn track(
        &mut self,
        log_index: LogIndex,
        term: Term,
    ) -> (CommandId, oneshot::Receiver<CommandStatus>) {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.by_id.insert(
            id,
            Tracked {
                log_index,
                term,
                reply: Some(tx),
            },
        );
        self.by_index.insert(log_index, id);
        (id, rx)
    }

    /// Resolve every tracked command whose log index is `<= commit_index`,
    /// as `Success` (§4.6: a command is only resolved once its own index
    /// commits, and only if proposed in the leader's current term, which is
    /// enforced by the caller never tracking a stale-term entry).
    pub fn resolve_up_to(&mut self, commit_index: LogIndex) {
        let resolved: Vec<LogIndex> = self
            .by_index
            .range(..=commit_index)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in resolved {
            if let Some(id) = self.by_index.remove(&idx) {
                if let Some(mut tracked) = self.by_id.remove(&id) {
                    if let Some(tx) = tracked.reply.take() {
                        let _ = tx.send(CommandStatus::Success);
                    }
                }
            }
        }
    }

    /// Fail every still-tracked command with `status`, e.g. on stepping down
    /// from leader or shutting down (§4.6).
    pub fn fail_all(&mut self, status: CommandStatus) {
        for (_, mut tracked) in self.by_id.drain() {
            if let Some(tx) = tracked.reply.take() {
                let _ = tx.send(status);
            }
        }
        self.by_index.clear();
    }

    /// Fail only commands proposed in `term`, used when a leader in a later
    /// term preempts an older in-flight proposal for the same log position
    /// (§4.6 edge case: an overwritten uncommitted entry never commits).
    pub fn fail_term(&mut self, term: Term, status: CommandStatus) {
        let stale: Vec<LogIndex> = self
            .by_id
            .values()
            .filter(|t| t.term == term)
            .map(|t| t.log_index)
            .collect();
        for idx in stale {
            if let Some(id) = self.by_index.remove(&idx) {
                if let Some(mut tracked) = self.by_id.remove(&id) {
                    if let Some(tx) = tracked.reply.take() {
                        let _ = tx.send(status);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
