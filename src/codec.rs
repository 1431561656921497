//! The RPC envelope and message bodies exchanged between servers (§4.2, §6.2).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ServerOpStatus;
use crate::log::EntryPayload;
use crate::raft_types::ClusterId;
use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;
use crate::raft_types::Term;

/// An entry as it travels over the wire inside an `AppendRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

/// `AppendEntries` request (§4.5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub prev_log_term: Term,
    pub prev_log_index: LogIndex,
    pub leader_commit: LogIndex,
    pub entries: Vec<WireEntry>,
}

/// `AppendEntries` reply (§4.5).
///
/// `log_end` is always reported (even on a rejection), so the leader can
/// fast-rewind `next_index` without a round of one-at-a-time backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendReply {
    pub term: Term,
    pub success: bool,
    pub log_end: LogIndex,
}

/// `RequestVote` request (§4.4).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub last_log_term: Term,
    pub last_log_index: LogIndex,
}

/// `RequestVote` reply (§4.4).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// A server newly contacting the cluster, before it knows the cluster id (§4.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub server_id: ServerId,
    pub address: String,
}

/// `AddServer` request, sent to any server; non-leaders redirect (§4.7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddServerRequest {
    pub server_id: ServerId,
    pub address: String,
}

/// `AddServer`/`RemoveServer` reply (§4.7, §6.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerOpReply {
    pub status: ServerOpStatus,
    /// Present on `NotLeader` when this server knows who the leader is.
    pub leader_hint: Option<ServerId>,
}

/// `RemoveServer` request (§4.7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoveServerRequest {
    pub server_id: ServerId,
}

/// `InstallSnapshot` request. `data` is always a valid UTF-8 chunk boundary
/// (§4.8): multi-byte sequences are never split across chunks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub last_term: Term,
    pub last_index: LogIndex,
    pub last_servers: BTreeMap<ServerId, String>,
    pub offset: u64,
    pub data: String,
    pub done: bool,
}

/// `InstallSnapshot` reply (§4.8).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
    /// The byte offset this server has stored so far; lets the leader
    /// resume/restart the chunk stream precisely on a gap.
    pub offset_received: u64,
}

/// Tagged union of every possible RPC body (§6.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcBody {
    HelloRequest(HelloRequest),
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AddServerRequest(AddServerRequest),
    RemoveServerRequest(RemoveServerRequest),
    ServerOpReply(ServerOpReply),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotReply(InstallSnapshotReply),
}

/// The envelope every message travels in (§4.2).
///
/// `cluster` is absent only on the very first message a joining server
/// sends (it does not yet know the cluster id); every later message
/// carries it, and a mismatch is rejected with a `ProtocolError::ClusterMismatch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cluster: Option<ClusterId>,
    pub from: ServerId,
    pub to: Option<ServerId>,
    pub body: RpcBody,
}

/// Split `data` into chunks no larger than `max_len` bytes, each chunk
/// ending on a UTF-8 character boundary (§4.8).
pub fn chunk_snapshot_data(data: &str, max_len: usize) -> Vec<&str> {
    if data.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < data.len() {
        let mut end = (start + max_len).min(data.len());
        while end > start && !data.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len landed inside a multi-byte character that began at
            // `start`; widen to the next boundary so forward progress is
            // still made.
            end = start + 1;
            while end < data.len() && !data.is_char_boundary(end) {
                end += 1;
            }
        }
        chunks.push(&data[start..end]);
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_char_boundaries() {
        let data = "a\u{1F600}bc"; // emoji is 4 bytes
        let chunks = chunk_snapshot_data(data, 2);
        for c in &chunks {
            assert!(data.contains(*c));
        }
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn empty_data_yields_one_empty_chunk() {
        assert_eq!(chunk_snapshot_data("", 16), vec![""]);
    }
}
