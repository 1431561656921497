//! Snapshot installation, leader and follower sides (§4.8).

use crate::codec::InstallSnapshotRequest;
use crate::log::ServerAddressMap;
use crate::raft_types::LogIndex;
use crate::raft_types::Term;

/// Leader-side progress streaming a snapshot to one follower.
#[derive(Clone, Debug)]
pub struct SnapshotStream {
    pub last_term: Term,
    pub last_index: LogIndex,
    pub last_servers: ServerAddressMap,
    pub data: String,
    pub offset: usize,
}

impl SnapshotStream {
    pub fn new(last_term: Term, last_index: LogIndex, last_servers: ServerAddressMap, data: String) -> Self {
        Self {
            last_term,
            last_index,
            last_servers,
            data,
            offset: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Build the next chunk request, honoring `max_chunk_len` and UTF-8
    /// boundaries (§4.8).
    pub fn next_request(&self, term: Term, max_chunk_len: usize) -> InstallSnapshotRequest {
        let remaining = &self.data[self.offset..];
        let chunk = crate::codec::chunk_snapshot_data(remaining, max_chunk_len)
            .into_iter()
            .next()
            .unwrap_or("");
        InstallSnapshotRequest {
            term,
            last_term: self.last_term,
            last_index: self.last_index,
            last_servers: self.last_servers.clone(),
            offset: self.offset as u64,
            data: chunk.to_string(),
            done: self.offset + chunk.len() >= self.data.len(),
        }
    }

    /// Advance past a chunk the follower acknowledged, or reset to restart
    /// from `offset_received` on a gap/mismatch (§4.8).
    pub fn advance(&mut self, offset_received: u64) {
        self.offset = (offset_received as usize).min(self.data.len());
    }
}

/// Follower-side snapshot-in-progress buffer, assembled chunk by chunk.
#[derive(Clone, Debug, Default)]
pub struct SnapshotReceiver {
    pub expected_offset: u64,
    pub buffer: String,
}

/// The outcome of feeding one `InstallSnapshotRequest` chunk to a follower's
/// in-progress receiver.
pub enum ReceiveOutcome {
    /// Chunk accepted; `offset_received` should be echoed back.
    Accepted { offset_received: u64 },
    /// The request's `offset` does not match what this follower expects;
    /// the leader should restart the stream from `offset_received`.
    Mismatch { offset_received: u64 },
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, req: &InstallSnapshotRequest) -> ReceiveOutcome {
        if req.offset != self.expected_offset {
            return ReceiveOutcome::Mismatch {
                offset_received: self.expected_offset,
            };
        }
        self.buffer.push_str(&req.data);
        self.expected_offset += req.data.len() as u64;
        ReceiveOutcome::Accepted {
            offset_received: self.expected_offset,
        }
    }
}
