//! Runtime configuration for a Raft node.

use rand::thread_rng;
use rand::Rng;

/// Errors which may come up when building a `Config` instance.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min must be < election_timeout_max")]
    InvalidElectionTimeoutRange,
    #[error("max_payload_entries must be > 0")]
    MaxPayloadEntriesTooSmall,
}

/// Runtime config for a Raft node.
///
/// The values here correspond directly to the constants named in §4.4 and
/// §4.8 of the protocol description: a 1024-2048ms randomized election
/// timeout, a heartbeat period of a third of the minimum timeout, and a
/// 4096 byte snapshot chunk size.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the cluster this node is part of, used only for tracing spans.
    pub cluster_name: String,

    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The interval, in milliseconds, at which leaders send heartbeats.
    pub heartbeat_interval: u64,

    /// The maximum number of entries sent in a single AppendEntries RPC.
    pub max_payload_entries: u64,
    /// The maximum number of bytes sent in a single InstallSnapshot chunk (§4.8).
    pub max_snapshot_chunk_size: u64,

    /// An implementation-chosen bound on how long a joining server may sit in
    /// `Catchup` phase without progress before the add is reported as
    /// `Timeout` (§4.7).
    pub catchup_timeout: u64,
}

impl Config {
    /// Start building a new config for the named cluster.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            max_snapshot_chunk_size: None,
            catchup_timeout: None,
        }
    }

    /// Generate a new randomized election timeout, uniformly distributed in
    /// `[election_timeout_min, election_timeout_max)` (§4.4).
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for `Config` instances, following the teacher's
/// build-then-validate pattern.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    max_snapshot_chunk_size: Option<u64>,
    catchup_timeout: Option<u64>,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = Some(v);
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = Some(v);
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = Some(v);
        self
    }

    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = Some(v);
        self
    }

    pub fn max_snapshot_chunk_size(mut self, v: u64) -> Self {
        self.max_snapshot_chunk_size = Some(v);
        self
    }

    pub fn catchup_timeout(mut self, v: u64) -> Self {
        self.catchup_timeout = Some(v);
        self
    }

    /// Validate and construct the final `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(1024);
        let election_timeout_max = self.election_timeout_max.unwrap_or(2048);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutRange);
        }

        let heartbeat_interval = self.heartbeat_interval.unwrap_or(election_timeout_min / 3);

        let max_payload_entries = self.max_payload_entries.unwrap_or(64);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            max_snapshot_chunk_size: self.max_snapshot_chunk_size.unwrap_or(4096),
            catchup_timeout: self.catchup_timeout.unwrap_or(election_timeout_max * 10),
        })
    }
}
