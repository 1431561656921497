//! Single-server-at-a-time membership reconfiguration (§4.7).
//!
//! Unlike joint-consensus schemes, at most one `AddServer`/`RemoveServer` may
//! be in flight at a time; a second request while one is in progress is
//! rejected with `ServerOpStatus::InProgress`. This module only decides what
//! the reply to the original caller *should* be — an immediate status, or a
//! deferred one the caller holds open until `finish_in_flight`/
//! `cancel_in_flight`/a catch-up timeout resolves it (§4.7, `core::mod`'s
//! `MembershipReply`).

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use crate::error::ServerOpStatus;
use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;

/// The phase a server under reconfiguration is in (§4.7).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerPhase {
    /// A normal voting member.
    Stable,
    /// Being added: receiving log entries as a non-voter until it catches up.
    Catchup,
    /// Caught up; a `ServerConfig` entry making it a voter is about to be proposed.
    CaughtUp,
    /// The `ServerConfig` add entry has been appended and is awaiting commit.
    Committing,
    /// Marked for removal; awaiting the `ServerConfig` entry that removes it
    /// to commit (§4.7: set immediately on `RemoveServer`, not only once the
    /// entry is durable).
    Remove,
}

/// Per-server reconfiguration bookkeeping the leader tracks outside the
/// committed server set (§4.7).
#[derive(Clone, Debug)]
pub struct ServerDescriptor {
    pub id: ServerId,
    pub address: String,
    pub phase: ServerPhase,
    /// Set when this descriptor was created by an in-flight add; cleared once
    /// `phase` reaches `Stable`.
    pub added_at: Option<Instant>,
}

/// Drives a single in-flight `AddServer` or `RemoveServer` operation.
#[derive(Debug)]
pub struct ReconfigInFlight {
    pub target: ServerId,
    pub is_add: bool,
    /// Index of the `ServerConfig` entry once appended.
    pub config_entry_index: Option<LogIndex>,
}

/// What the caller of `begin_add`/`begin_remove` should do about the reply
/// to the original requester.
pub enum ReconfigOutcome {
    /// Reply immediately with this status.
    Immediate(ServerOpStatus),
    /// Hold the reply open; it resolves later via `finish_in_flight`,
    /// `cancel_in_flight`, or a catch-up timeout (§4.7).
    Deferred,
}

/// Leader-side membership state: the current phase of every non-stable
/// server, plus at most one in-flight reconfiguration.
#[derive(Debug, Default)]
pub struct MembershipDriver {
    descriptors: BTreeMap<ServerId, ServerDescriptor>,
    in_flight: Option<ReconfigInFlight>,
}

impl MembershipDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<&ReconfigInFlight> {
        self.in_flight.as_ref()
    }

    pub fn phase_of(&self, id: ServerId) -> ServerPhase {
        self.descriptors
            .get(&id)
            .map(|d| d.phase)
            .unwrap_or(ServerPhase::Stable)
    }

    /// Begin adding `id`/`address` as a non-voting catchup server (§4.7).
    /// `already_member` reflects the leader's committed `ServerSet`, not any
    /// in-flight reconfiguration.
    pub fn begin_add(&mut self, id: ServerId, address: String, already_member: bool) -> ReconfigOutcome {
        if already_member {
            if self.phase_of(id) == ServerPhase::Remove {
                // Configured but marked for removal: cancel the pending
                // removal and reinstate as Stable (§4.7).
                if matches!(&self.in_flight, Some(f) if !f.is_add && f.target == id) {
                    self.in_flight = None;
                }
                if let Some(d) = self.descriptors.get_mut(&id) {
                    d.phase = ServerPhase::Stable;
                } else {
                    self.descriptors.remove(&id);
                }
                return ReconfigOutcome::Immediate(ServerOpStatus::Success);
            }
            return ReconfigOutcome::Immediate(ServerOpStatus::NoOp);
        }
        if let Some(flight) = &self.in_flight {
            if !flight.is_add && flight.target == id {
                return ReconfigOutcome::Immediate(ServerOpStatus::Committing);
            }
            return ReconfigOutcome::Immediate(ServerOpStatus::InProgress);
        }
        self.descriptors.insert(
            id,
            ServerDescriptor {
                id,
                address,
                phase: ServerPhase::Catchup,
                added_at: Some(Instant::now()),
            },
        );
        self.in_flight = Some(ReconfigInFlight {
            target: id,
            is_add: true,
            config_entry_index: None,
        });
        ReconfigOutcome::Deferred
    }

    /// Begin removing `id` (§4.7). `is_member` reflects the leader's
    /// committed `ServerSet`.
    pub fn begin_remove(&mut self, id: ServerId, is_member: bool) -> ReconfigOutcome {
        if let Some(flight) = &self.in_flight {
            if flight.is_add && flight.target == id {
                // The target is the pending add: cancel it (its own caller
                // is resolved as Canceled via `cancel_in_flight`) and reply
                // Ok to the remover since there is nothing left to remove.
                self.in_flight = None;
                self.descriptors.remove(&id);
                return ReconfigOutcome::Immediate(ServerOpStatus::Success);
            }
        }
        if !is_member {
            return ReconfigOutcome::Immediate(ServerOpStatus::NoOp);
        }
        match self.phase_of(id) {
            ServerPhase::Catchup | ServerPhase::CaughtUp | ServerPhase::Committing => {
                return ReconfigOutcome::Immediate(ServerOpStatus::Committing);
            }
            ServerPhase::Remove => return ReconfigOutcome::Immediate(ServerOpStatus::InProgress),
            ServerPhase::Stable => {}
        }
        if self.in_flight.is_some() {
            return ReconfigOutcome::Immediate(ServerOpStatus::InProgress);
        }
        self.descriptors.insert(
            id,
            ServerDescriptor {
                id,
                address: String::new(),
                phase: ServerPhase::Remove,
                added_at: None,
            },
        );
        self.in_flight = Some(ReconfigInFlight {
            target: id,
            is_add: false,
            config_entry_index: None,
        });
        ReconfigOutcome::Deferred
    }

    /// Move a `Catchup` server to `CaughtUp`, but only once its `match_index`
    /// has actually reached the leader's log end at the time of the reply
    /// (§4.5, §4.7) — a rejection, or a success that only advances partway
    /// through the log, must not promote it early, or the leader would start
    /// counting a server with a partial log toward quorum (§8 State Machine
    /// Safety).
    pub fn mark_caught_up(&mut self, id: ServerId, match_index: LogIndex, log_end: LogIndex) {
        if match_index + 1 < log_end {
            return;
        }
        if let Some(d) = self.descriptors.get_mut(&id) {
            if d.phase == ServerPhase::Catchup {
                d.phase = ServerPhase::CaughtUp;
            }
        }
    }

    /// Record that the `ServerConfig` entry for the in-flight reconfiguration
    /// has been appended at `index`. An add moves to `Committing`; a remove
    /// stays `Remove` (already set by `begin_remove`).
    pub fn mark_committing(&mut self, index: LogIndex) {
        if let Some(flight) = self.in_flight.as_mut() {
            flight.config_entry_index = Some(index);
            if flight.is_add {
                if let Some(d) = self.descriptors.get_mut(&flight.target) {
                    d.phase = ServerPhase::Committing;
                }
            }
        }
    }

    /// The in-flight reconfiguration's `ServerConfig` entry committed:
    /// finalize it (`Stable` for an add, descriptor removed for a remove)
    /// and clear `in_flight` so a new reconfiguration may begin. Returns the
    /// target id so the caller can resolve its deferred reply.
    pub fn finish_in_flight(&mut self) -> Option<ServerId> {
        let flight = self.in_flight.take()?;
        if flight.is_add {
            if let Some(d) = self.descriptors.get_mut(&flight.target) {
                d.phase = ServerPhase::Stable;
                d.added_at = None;
            }
        } else {
            self.descriptors.remove(&flight.target);
        }
        Some(flight.target)
    }

    /// Abort the in-flight reconfiguration without committing it, e.g. on a
    /// leadership change (§4.7: reported to the caller as `LostLeadership`).
    pub fn cancel_in_flight(&mut self) -> Option<ServerId> {
        let flight = self.in_flight.take()?;
        self.descriptors.remove(&flight.target);
        Some(flight.target)
    }

    /// `true` if the in-flight reconfiguration is a `Catchup` add that has
    /// sat without making progress for longer than `timeout` (§4.7, §9:
    /// implementation-chosen catch-up bound).
    pub fn catchup_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        match &self.in_flight {
            Some(flight) if flight.is_add => self
                .descriptors
                .get(&flight.target)
                .and_then(|d| d.added_at)
                .map(|started| now.duration_since(started) >= timeout)
                .unwrap_or(false),
            _ => false,
        }
    }
}
