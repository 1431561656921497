//! A single-threaded, durable Raft consensus engine with OVSDB-style
//! on-disk log replay (§1).
//!
//! This crate implements the protocol core only: leader election, log
//! replication, commit tracking, single-server-at-a-time membership
//! changes, and snapshot installation. The record log's framing, the wire
//! transport, and the application state machine are collaborators this
//! crate drives through the [`RecordLog`], [`RaftNetwork`] and
//! [`StateMachine`] traits, not implementations it owns (§1 scope).

#![cfg_attr(feature = "docinclude", feature(doc_cfg))]

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod raft_types;
pub mod state_machine;

pub use crate::codec::Envelope;
pub use crate::codec::RpcBody;
pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::CommandStatus;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::error::ServerOpStatus;
pub use crate::log::RecordLog;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::ClusterId;
pub use crate::raft_types::LogIndex;
pub use crate::raft_types::ServerId;
pub use crate::raft_types::Term;
pub use crate::state_machine::StateMachine;
