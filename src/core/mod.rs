//! `RaftCore`: the single-task event loop driving one server's state machine
//! (§3, §4).
//!
//! Unlike a design that spawns one task per replication stream, everything
//! here runs on one `tokio::task` inside `RaftCore::main`'s `select!` loop:
//! inbound RPCs, API calls, the election timer, per-peer heartbeat timers,
//! and durability progress are all just branches of the same loop.

pub mod command;
pub mod durability;
pub mod election;
pub mod membership;
pub mod replication;
pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::codec::AppendReply;
use crate::codec::AppendRequest;
use crate::codec::Envelope;
use crate::codec::HelloRequest;
use crate::codec::InstallSnapshotReply;
use crate::codec::InstallSnapshotRequest;
use crate::codec::RpcBody;
use crate::codec::ServerOpReply;
use crate::codec::VoteReply;
use crate::codec::VoteRequest;
use crate::codec::WireEntry;
use crate::config::Config;
use crate::core::command::CommandTracker;
use crate::core::durability::DurabilityHandle;
use crate::core::durability::DurabilityWaiters;
use crate::core::election::log_is_up_to_date;
use crate::core::election::ElectionTimer;
use crate::core::membership::MembershipDriver;
use crate::core::membership::ReconfigOutcome;
use crate::core::membership::ServerPhase;
use crate::core::replication::can_advance_commit;
use crate::core::replication::ReplicationTable;
use crate::core::snapshot::ReceiveOutcome;
use crate::core::snapshot::SnapshotReceiver;
use crate::core::snapshot::SnapshotStream;
use crate::error::CommandStatus;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ServerOpStatus;
use crate::error::StateError;
use crate::log::EntryPayload;
use crate::log::LogEntry;
use crate::log::LogStore;
use crate::log::Record;
use crate::log::RecordLog;
use crate::log::ServerAddressMap;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::network::PeerInfo;
use crate::network::RaftNetwork;
use crate::network::ServerSet;
use crate::raft_types::ClusterId;
use crate::raft_types::LogIndex;
use crate::raft_types::ServerId;
use crate::raft_types::Term;
use crate::state_machine::StateMachine;

/// The three roles a server can be in (§3). Catchup/non-voting status is
/// tracked separately as `joining`, not as a fourth role: a joining server
/// runs the ordinary follower state machine, it is simply excluded from
/// vote/commit quorum arithmetic until its `ServerConfig` entry commits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

/// Where to deliver the eventual result of an in-flight `AddServer`/
/// `RemoveServer` once it resolves (§4.7): either back to a local caller of
/// the `Raft` handle, or as a `ServerOpReply` to a remote peer that sent the
/// request over the wire.
enum MembershipReply {
    Local(oneshot::Sender<ServerOpStatus>),
    Remote(ServerId),
}

/// Requests the public `Raft` handle forwards onto the core's event loop.
pub enum RaftMsg {
    ClientWrite {
        data: Vec<u8>,
        tx: oneshot::Sender<RaftResult<CommandStatus>>,
    },
    AddServer {
        server_id: ServerId,
        address: String,
        tx: oneshot::Sender<ServerOpStatus>,
    },
    RemoveServer {
        server_id: ServerId,
        tx: oneshot::Sender<ServerOpStatus>,
    },
    /// Create a brand new single-server cluster rooted at this node.
    InitializeCluster {
        tx: oneshot::Sender<RaftResult<()>>,
    },
    /// Force an election start if this server is not already leader (§6.3).
    TakeLeadership,
    /// Kick off a join: dial every address in `remote_addresses` with an
    /// `AddServerRequest` handshake (§4.3, §6.3 `join`). `expected_cluster_id`,
    /// if given, is checked against the cluster id learned from whichever
    /// peer answers first.
    BeginJoin {
        remote_addresses: Vec<String>,
        expected_cluster_id: Option<ClusterId>,
    },
    /// Stop the event loop gracefully: fail every pending command with
    /// `Shutdown` and join the fsync worker before the task exits (§6.3).
    Shutdown,
}

/// Everything `RaftCore` needs to run: identity, durable state, volatile
/// state, and its collaborators (§3).
pub struct RaftCore<N: RaftNetwork, L: RecordLog, M: StateMachine> {
    id: ServerId,
    /// This server's own dial address, `"tcp:host[:port]"`/`"ssl:host[:port]"`
    /// (§3), recorded into the membership set on `initialize_cluster` and
    /// advertised in outbound `AddServerRequest`/`HelloRequest` (§4.3).
    local_address: String,
    cluster_id: Option<ClusterId>,
    /// Set only while joining with a caller-supplied expectation (§6.3
    /// `join`'s `expected_cluster_id`); checked against whatever cluster id
    /// is learned from the first envelope that carries one.
    expected_cluster_id: Option<ClusterId>,
    config: Config,

    network: Arc<N>,
    state_machine: Arc<M>,

    durability: DurabilityHandle,
    waiters: DurabilityWaiters,

    log: LogStore,
    current_term: Term,
    voted_for: Option<ServerId>,

    commit_index: LogIndex,
    last_applied: LogIndex,

    state: State,
    current_leader: Option<ServerId>,
    /// True until this server's own `ServerConfig` membership entry commits
    /// (§4.7/§9 Design Note: cleared only once a committed entry lists us).
    joining: bool,
    /// Set once the fsync worker reports a persistent-write failure. A
    /// demoted server refuses to grant votes or accept new client writes
    /// until the operator intervenes (§7, §9 Open Question resolution).
    log_failed: bool,

    servers: ServerSet,
    membership: MembershipDriver,
    /// Where to deliver the result of the currently in-flight reconfiguration
    /// (`membership.in_flight()`), if any. Always `None` when `in_flight()`
    /// is `None` (§4.7).
    membership_reply: Option<MembershipReply>,
    replication: ReplicationTable,
    election_timer: ElectionTimer,
    votes_received: std::collections::BTreeSet<ServerId>,

    commands: CommandTracker,

    metrics_tx: watch::Sender<RaftMetrics>,

    api_rx: mpsc::UnboundedReceiver<RaftMsg>,
    rpc_rx: mpsc::UnboundedReceiver<Envelope>,

    snapshot_streams: BTreeMap<ServerId, SnapshotStream>,
    snapshot_receiver: Option<SnapshotReceiver>,

    /// Outbound replies gated on durability: a positive vote grant or
    /// `AppendReply` is only sent once the record backing it has been
    /// fsynced, so a crash can never make a follower's prior promise
    /// disappear (§5).
    pending_replies: Vec<(u64, ServerId, Envelope)>,

    /// The leader's own `match_index`, i.e. how far its own log is known to
    /// be durable. Entries the leader has appended but not yet fsynced do
    /// not count toward quorum for the commit index (§4.4/§5/§8): each
    /// append's durability sequence number is queued here until the fsync
    /// worker reports it durable.
    durable_match: LogIndex,
    pending_self_match: Vec<(u64, LogIndex)>,

    _marker: std::marker::PhantomData<L>,
}

impl<N: RaftNetwork, L: RecordLog, M: StateMachine> RaftCore<N, L, M> {
    /// Construct a core, first replaying whatever `log_storage` already
    /// holds (§4.9 crash-recovery) before handing it off to the fsync
    /// worker thread (§5). A log with no records yet (a freshly `create`d
    /// file) leaves every field at its just-created default.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ServerId,
        local_address: String,
        config: Config,
        network: Arc<N>,
        state_machine: Arc<M>,
        mut log_storage: L,
        api_rx: mpsc::UnboundedReceiver<RaftMsg>,
        rpc_rx: mpsc::UnboundedReceiver<Envelope>,
        metrics_tx: watch::Sender<RaftMetrics>,
    ) -> Self {
        let replayed = match crate::log::replay(&mut log_storage) {
            Ok(replayed) => replayed,
            Err(err) => {
                tracing::error!(?err, "failed to replay record log; starting as an empty follower");
                None
            }
        };
        if let Some(r) = &replayed {
            if r.server_id != id {
                tracing::error!(on_disk = %r.server_id, given = %id, "record log's server_id header does not match this server's identity");
            }
        }

        let durability = DurabilityHandle::spawn(log_storage);
        let timeout = Duration::from_millis(config.new_rand_election_timeout());

        let (cluster_id, current_term, voted_for, log, joining, servers, prev_index) = match replayed {
            Some(r) => {
                let fallback_servers = r.log.prev_servers.clone();
                // Walk the replayed entries to find the latest `ServerConfig`,
                // which supersedes the snapshot's `prev_servers` (§4.9: "server
                // set derived from the latest ServerConfig entry in the log, or
                // from prev_servers if none").
                let latest_config = (r.log.log_start()..r.log.log_end())
                    .filter_map(|idx| r.log.entry(idx))
                    .filter_map(|e| match &e.payload {
                        EntryPayload::ServerConfig(map) => Some(map.clone()),
                        EntryPayload::Data(_) => None,
                    })
                    .last();
                let servers = latest_config.unwrap_or(fallback_servers);
                let joining = !servers.contains_key(&id);
                (Some(r.cluster_id), r.current_term, r.voted_for, r.log, joining, servers, r.prev_index)
            }
            None => (
                None,
                0,
                None,
                LogStore::new_empty(ServerAddressMap::new(), None),
                true,
                ServerAddressMap::new(),
                1,
            ),
        };

        let mut server_set = ServerSet::new();
        server_set.set_configured(servers.iter().map(|(peer_id, addr)| PeerInfo {
            id: *peer_id,
            address: addr.clone(),
        }));

        Self {
            id,
            local_address,
            cluster_id,
            expected_cluster_id: None,
            config,
            network,
            state_machine,
            durability,
            waiters: DurabilityWaiters::new(),
            log,
            current_term,
            voted_for,
            // Everything up to `prev_index` is already covered by the
            // snapshot, hence already committed and applied (§3 invariant 6).
            commit_index: prev_index,
            last_applied: prev_index,
            state: State::Follower,
            current_leader: None,
            joining,
            log_failed: false,
            servers: server_set,
            membership: MembershipDriver::new(),
            membership_reply: None,
            replication: ReplicationTable::new(),
            election_timer: ElectionTimer::new(timeout),
            votes_received: Default::default(),
            commands: CommandTracker::new(),
            metrics_tx,
            api_rx,
            rpc_rx,
            snapshot_streams: BTreeMap::new(),
            snapshot_receiver: None,
            pending_replies: Vec::new(),
            durable_match: prev_index,
            pending_self_match: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// The single event loop. Runs until both channels close.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.id))]
    pub async fn run(mut self) {
        self.announce_on_start().await;
        loop {
            let mut durable_rx = self.durability.durable_receiver();

            let heartbeat_sleep = if self.state == State::Leader {
                tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval))
            } else {
                tokio::time::sleep(Duration::from_secs(3600))
            };
            tokio::pin!(heartbeat_sleep);

            let election_deadline = self.election_timer.deadline();

            tokio::select! {
                _ = tokio::time::sleep_until(election_deadline.into()), if self.state != State::Leader => {
                    self.on_election_timeout().await;
                }
                _ = &mut heartbeat_sleep, if self.state == State::Leader => {
                    self.send_heartbeats().await;
                }
                changed = durable_rx.changed() => {
                    if changed.is_ok() {
                        let durable = self.durability.durable_seq();
                        self.waiters.release_up_to(durable);
                        self.advance_durable_match(durable);
                        self.flush_pending_replies(durable).await;
                        self.advance_commit_index();
                        self.apply_committed().await;
                    }
                }
                msg = self.rpc_rx.recv() => {
                    match msg {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break,
                    }
                }
                msg = self.api_rx.recv() => {
                    match msg {
                        Some(RaftMsg::Shutdown) | None => break,
                        Some(msg) => self.handle_api(msg).await,
                    }
                }
            }

            self.observe_log_health().await;
            self.observe_membership_timeout().await;
            self.publish_metrics();
        }
        self.waiters.fail_all();
        self.commands.fail_all(CommandStatus::Shutdown);
        self.durability.shutdown_and_join();
    }

    /// Emit the outbound-session handshake every already-configured peer's
    /// session gets on (re)connect (§4.3): a plain `HelloRequest`, since a
    /// server started via `open`/`create` is not joining. `join` sends its
    /// own `AddServerRequest` handshake separately, once `BeginJoin` arrives
    /// with the addresses to dial, so there is nothing to announce here
    /// while still joining.
    async fn announce_on_start(&mut self) {
        if self.joining {
            return;
        }
        for peer in self.servers.configured_ids().filter(|p| *p != self.id).collect::<Vec<_>>() {
            let envelope = self.envelope(
                Some(peer),
                RpcBody::HelloRequest(HelloRequest {
                    server_id: self.id,
                    address: self.local_address.clone(),
                }),
            );
            self.network.send(peer, envelope).await;
        }
    }

    /// Demote to follower and stop granting votes/accepting writes the
    /// first time the fsync worker reports a persistent-write failure
    /// (§7, §9): the log is no longer trustworthy, so this server must not
    /// continue acting as if its durable state is intact.
    async fn observe_log_health(&mut self) {
        if self.log_failed || !self.durability.has_failed() {
            return;
        }
        self.log_failed = true;
        tracing::error!("record log write failed; demoting and refusing further writes");
        self.step_down().await;
    }

    /// Abandon an `AddServer` whose catch-up phase has stalled, replying
    /// `Timeout` to the caller (§4.7, §9).
    async fn observe_membership_timeout(&mut self) {
        let timed_out = self
            .membership
            .catchup_timed_out(Instant::now(), Duration::from_millis(self.config.catchup_timeout));
        if !timed_out {
            return;
        }
        if let Some(target) = self.membership.cancel_in_flight() {
            self.servers.forget_ad_hoc(target);
            self.replication.remove(target);
        }
        self.resolve_membership_reply(ServerOpStatus::Timeout).await;
    }

    fn publish_metrics(&self) {
        let leader_metrics = if self.state == State::Leader {
            Some(LeaderMetrics {
                replication: self
                    .replication
                    .iter()
                    .map(|(id, p)| (*id, p.match_index))
                    .collect(),
            })
        } else {
            None
        };
        let _ = self.metrics_tx.send(RaftMetrics {
            id: self.id,
            cluster_id: self.cluster_id,
            state: self.state,
            current_term: self.current_term,
            last_log_index: self.log.log_end() - 1,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            leader_metrics,
            joining: self.joining,
        });
    }

    // ---- term handling (§4.4) ----------------------------------------

    /// Apply the term-receive rule: any message bearing a term higher than
    /// ours forces a step-down to follower in the new term (§4.4).
    async fn observe_term(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.step_down().await;
        }
    }

    async fn step_down(&mut self) {
        if self.state == State::Leader {
            self.commands.fail_all(CommandStatus::LostLeadership);
            if self.membership.cancel_in_flight().is_some() {
                self.resolve_membership_reply(ServerOpStatus::LostLeadership).await;
            }
        }
        self.state = State::Follower;
        self.votes_received.clear();
    }

    /// Deliver the eventual status of the currently in-flight reconfiguration
    /// to wherever its caller is waiting (§4.7).
    async fn resolve_membership_reply(&mut self, status: ServerOpStatus) {
        if let Some(reply) = self.membership_reply.take() {
            self.send_membership_reply(reply, status).await;
        }
    }

    async fn send_membership_reply(&mut self, reply: MembershipReply, status: ServerOpStatus) {
        match reply {
            MembershipReply::Local(tx) => {
                let _ = tx.send(status);
            }
            MembershipReply::Remote(to) => {
                let envelope = self.envelope(
                    Some(to),
                    RpcBody::ServerOpReply(ServerOpReply {
                        status,
                        leader_hint: self.current_leader,
                    }),
                );
                self.network.send(to, envelope).await;
            }
        }
    }

    // ---- election (§4.4) ---------------------------------------------

    async fn on_election_timeout(&mut self) {
        if self.joining {
            // A joining, non-voting server never starts an election.
            self.reset_election_timer();
            return;
        }
        self.current_term += 1;
        self.state = State::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = std::collections::BTreeSet::new();
        self.votes_received.insert(self.id);
        self.current_leader = None;
        self.reset_election_timer();

        let (last_term, last_index) = self.log.last_log_pos();
        let term = self.current_term;
        for peer in self.servers.configured_ids().collect::<Vec<_>>() {
            if peer == self.id {
                continue;
            }
            let envelope = self.envelope(
                Some(peer),
                RpcBody::VoteRequest(VoteRequest {
                    term,
                    last_log_term: last_term,
                    last_log_index: last_index,
                }),
            );
            self.network.send(peer, envelope).await;
        }

        self.maybe_become_leader();
    }

    fn reset_election_timer(&mut self) {
        let timeout = Duration::from_millis(self.config.new_rand_election_timeout());
        self.election_timer.reset(timeout);
    }

    fn quorum_size(&self) -> usize {
        crate::quorum::majority_of(self.servers.configured().len().max(1))
    }

    fn maybe_become_leader(&mut self) {
        if self.state != State::Candidate {
            return;
        }
        if self.votes_received.len() < self.quorum_size() {
            return;
        }
        self.state = State::Leader;
        self.current_leader = Some(self.id);
        let log_end = self.log.log_end();
        let peers: Vec<ServerId> = self
            .servers
            .configured_ids()
            .filter(|p| *p != self.id)
            .collect();
        self.replication.reset_for(peers, log_end);
        tracing::info!(term = self.current_term, "became leader");
    }

    // ---- RPC dispatch ---------------------------------------------------

    async fn handle_envelope(&mut self, envelope: Envelope) {
        if self.cluster_id.is_none() {
            if let Some(got) = envelope.cluster {
                if let Some(expected) = self.expected_cluster_id {
                    if expected != got {
                        tracing::warn!(%got, %expected, "rejecting first contact from an unexpected cluster");
                        return;
                    }
                }
                // First contact: learn the cluster id we're joining (§3, §4.3).
                self.cluster_id = Some(got);
            }
        }
        if let (Some(mine), Some(got)) = (self.cluster_id, envelope.cluster) {
            if mine != got {
                tracing::warn!(%got, expected = %mine, "rejecting message for foreign cluster");
                return;
            }
        }
        if let Some(to) = envelope.to {
            if to != self.id {
                tracing::warn!(got = %to, expected = %self.id, "rejecting misrouted message");
                return;
            }
        }
        match envelope.body {
            RpcBody::HelloRequest(req) => self.handle_hello(envelope.from, req).await,
            RpcBody::AppendRequest(req) => self.handle_append_request(envelope.from, req).await,
            RpcBody::AppendReply(reply) => self.handle_append_reply(envelope.from, reply).await,
            RpcBody::VoteRequest(req) => self.handle_vote_request(envelope.from, req).await,
            RpcBody::VoteReply(reply) => self.handle_vote_reply(envelope.from, reply).await,
            RpcBody::AddServerRequest(req) => {
                self.begin_add_server(
                    req.server_id,
                    req.address,
                    MembershipReply::Remote(envelope.from),
                )
                .await;
            }
            RpcBody::RemoveServerRequest(req) => {
                self.begin_remove_server(req.server_id, MembershipReply::Remote(envelope.from))
                    .await;
            }
            RpcBody::ServerOpReply(_) => {
                // Replies to our own forwarded AddServer/RemoveServer requests
                // are resolved through the caller's own oneshot, not here.
            }
            RpcBody::InstallSnapshotRequest(req) => {
                self.handle_install_snapshot_request(envelope.from, req).await
            }
            RpcBody::InstallSnapshotReply(reply) => {
                self.handle_install_snapshot_reply(envelope.from, reply).await
            }
        }
    }

    async fn handle_hello(&mut self, from: ServerId, req: HelloRequest) {
        self.servers.note_ad_hoc(PeerInfo {
            id: from,
            address: req.address,
        });
    }

    fn envelope(&self, to: Option<ServerId>, body: RpcBody) -> Envelope {
        Envelope {
            cluster: self.cluster_id,
            from: self.id,
            to,
            body,
        }
    }

    // ---- vote RPC (§4.4) ------------------------------------------------

    async fn handle_vote_request(&mut self, from: ServerId, req: VoteRequest) {
        self.observe_term(req.term).await;
        if req.term < self.current_term {
            self.reply_vote(from, false).await;
            return;
        }
        let already_voted_other = matches!(self.voted_for, Some(v) if v != from);
        let (last_term, last_index) = self.log.last_log_pos();
        let up_to_date =
            log_is_up_to_date(req.last_log_term, req.last_log_index, last_term, last_index);

        if self.log_failed || already_voted_other || !up_to_date {
            self.reply_vote(from, false).await;
            return;
        }
        self.voted_for = Some(from);
        self.reset_election_timer();
        let term = self.current_term;
        let seq = self.durability.request(Record::State {
            term,
            vote: Some(from),
        });
        let envelope = self.envelope(
            Some(from),
            RpcBody::VoteReply(VoteReply {
                term,
                vote_granted: true,
            }),
        );
        self.defer_until_durable(seq, from, envelope);
        let durable = self.durability.durable_seq();
        self.flush_pending_replies(durable).await;
    }

    async fn reply_vote(&mut self, to: ServerId, granted: bool) {
        let envelope = self.envelope(
            Some(to),
            RpcBody::VoteReply(VoteReply {
                term: self.current_term,
                vote_granted: granted,
            }),
        );
        self.network.send(to, envelope).await;
    }

    /// Queue `envelope` to be sent to `to` once `seq` becomes durable.
    /// `flush_pending_replies` must be called afterward to release it
    /// immediately if `seq` already is durable.
    fn defer_until_durable(&mut self, seq: u64, to: ServerId, envelope: Envelope) {
        self.pending_replies.push((seq, to, envelope));
    }

    /// Queue the leader's own append at `index` to count toward its
    /// `match_index` only once `seq` is durable (§4.4/§5/§8).
    fn defer_self_match_until_durable(&mut self, seq: u64, index: LogIndex) {
        self.pending_self_match.push((seq, index));
    }

    /// Advance `durable_match` to the highest self-appended index whose
    /// durability sequence number is now `<= durable`.
    fn advance_durable_match(&mut self, durable: u64) {
        let mut advanced = None;
        self.pending_self_match.retain(|(seq, index)| {
            if *seq <= durable {
                advanced = Some(advanced.map_or(*index, |m: LogIndex| m.max(*index)));
                false
            } else {
                true
            }
        });
        if let Some(index) = advanced {
            self.durable_match = self.durable_match.max(index);
        }
    }

    async fn flush_pending_replies(&mut self, durable: u64) {
        let (ready, pending): (Vec<_>, Vec<_>) =
            self.pending_replies.drain(..).partition(|(seq, _, _)| *seq <= durable);
        self.pending_replies = pending;
        for (_, to, envelope) in ready {
            self.network.send(to, envelope).await;
        }
    }

    async fn handle_vote_reply(&mut self, from: ServerId, reply: VoteReply) {
        self.observe_term(reply.term).await;
        if self.state != State::Candidate || reply.term != self.current_term {
            return;
        }
        if reply.vote_granted {
            self.votes_received.insert(from);
            self.maybe_become_leader();
        }
    }

    // ---- append entries (§4.5) ------------------------------------------

    async fn handle_append_request(&mut self, from: ServerId, req: AppendRequest) {
        self.observe_term(req.term).await;
        if req.term < self.current_term {
            self.reply_append(from, false).await;
            return;
        }
        self.current_leader = Some(from);
        self.state = State::Follower;
        self.reset_election_timer();

        // Everything up to and including this index is covered by our own
        // snapshot, hence no longer present in `self.log` to validate
        // against (§4.5, §8 boundary behaviors).
        let boundary = self.log.prev_index();
        let entries = if req.prev_log_index == 0 || req.prev_log_index >= boundary {
            let have_prev = req.prev_log_index == 0
                || self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
            if !have_prev {
                self.reply_append(from, false).await;
                return;
            }
            req.entries
        } else {
            let last_sent = req.prev_log_index + req.entries.len() as LogIndex;
            if last_sent < boundary {
                // Entirely before the snapshot boundary: we already have all
                // of this by virtue of the snapshot itself.
                self.reply_append(from, true).await;
                return;
            }
            // The request straddles (or lands exactly on) the boundary:
            // validate at the seam entry instead of `prev_log_index`, which
            // predates what our snapshot kept.
            let seam_term = req.entries.iter().find(|e| e.index == boundary).map(|e| e.term);
            if seam_term != Some(self.log.prev_term) {
                self.reply_append(from, false).await;
                return;
            }
            if last_sent == boundary {
                self.reply_append(from, true).await;
                return;
            }
            req.entries.into_iter().filter(|e| e.index >= self.log.log_start()).collect()
        };

        let mut last_seq = None;
        for wire in entries {
            let needs_append = match self.log.term_at(wire.index) {
                Some(existing_term) if existing_term != wire.term => {
                    self.log.truncate_to(wire.index);
                    self.commands.fail_term(existing_term, CommandStatus::LostLeadership);
                    true
                }
                Some(_) => false,
                None => true,
            };
            if needs_append {
                let term = wire.term;
                let index = wire.index;
                let payload = wire.payload;
                self.log.append(LogEntry {
                    term,
                    payload: payload.clone(),
                });
                last_seq = Some(self.durability.request(Record::Entry { term, index, payload }));
            }
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.log.log_end() - 1);
            self.apply_committed().await;
        }

        let log_end = self.log.log_end();
        let term = self.current_term;
        let envelope = self.envelope(
            Some(from),
            RpcBody::AppendReply(AppendReply {
                term,
                success: true,
                log_end,
            }),
        );
        match last_seq {
            Some(seq) => {
                self.defer_until_durable(seq, from, envelope);
                let durable = self.durability.durable_seq();
                self.flush_pending_replies(durable).await;
            }
            None => self.network.send(from, envelope).await,
        }
    }

    async fn reply_append(&mut self, to: ServerId, success: bool) {
        let envelope = self.envelope(
            Some(to),
            RpcBody::AppendReply(AppendReply {
                term: self.current_term,
                success,
                log_end: self.log.log_end(),
            }),
        );
        self.network.send(to, envelope).await;
    }

    async fn handle_append_reply(&mut self, from: ServerId, reply: AppendReply) {
        self.observe_term(reply.term).await;
        if self.state != State::Leader || reply.term != self.current_term {
            return;
        }
        let sent_up_to = self.log.log_end() - 1;
        if let Some(progress) = self.replication.get_mut(from) {
            if reply.success {
                progress.on_success(sent_up_to);
            } else {
                progress.on_rejected(reply.log_end);
            }
        }
        if let Some(progress) = self.replication.get(from) {
            self.membership.mark_caught_up(from, progress.match_index, self.log.log_end());
        }
        self.advance_commit_index();
        self.maybe_finalize_membership();
        self.apply_committed().await;
    }

    fn advance_commit_index(&mut self) {
        let voters: Vec<ServerId> = self
            .servers
            .configured_ids()
            .filter(|id| !matches!(self.membership.phase_of(*id), ServerPhase::Catchup))
            .collect();
        let candidate = self.replication.majority_match_index(&voters, self.durable_match);
        if candidate <= self.commit_index {
            return;
        }
        let candidate_term = self.log.term_at(candidate).unwrap_or(0);
        if can_advance_commit(candidate, candidate_term, self.current_term) {
            self.commit_index = candidate;
            self.commands.resolve_up_to(self.commit_index);
        }
    }

    async fn send_heartbeats(&mut self) {
        let now = Instant::now();
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval);
        let peers: Vec<ServerId> = self.replication.iter().map(|(id, _)| *id).collect();
        for peer in peers {
            let due = self
                .replication
                .get(peer)
                .map(|p| p.due_for_heartbeat(now, heartbeat_interval) && !p.in_flight)
                .unwrap_or(false);
            if !due {
                continue;
            }
            self.send_append_to(peer).await;
        }
    }

    async fn send_append_to(&mut self, peer: ServerId) {
        let next_index = match self.replication.get(peer) {
            Some(p) => p.next_index,
            None => return,
        };
        if next_index < self.log.log_start() {
            self.begin_snapshot_stream(peer).await;
            return;
        }
        let prev_index = next_index - 1;
        let prev_term = self.log.term_at(prev_index).unwrap_or(self.log.prev_term);
        let entries: Vec<WireEntry> = self
            .log
            .entries(next_index, next_index + self.config.max_payload_entries)
            .iter()
            .enumerate()
            .map(|(offset, e)| WireEntry {
                term: e.term,
                index: next_index + offset as LogIndex,
                payload: e.payload.clone(),
            })
            .collect();

        let envelope = self.envelope(
            Some(peer),
            RpcBody::AppendRequest(AppendRequest {
                term: self.current_term,
                prev_log_term: prev_term,
                prev_log_index: prev_index,
                leader_commit: self.commit_index,
                entries,
            }),
        );
        if let Some(p) = self.replication.get_mut(peer) {
            p.last_sent_at = Some(Instant::now());
            p.in_flight = true;
        }
        self.network.send(peer, envelope).await;
    }

    // ---- apply to state machine (§4.1) ----------------------------------

    async fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            if let Some(entry) = self.log.entry(index).cloned() {
                match entry.payload {
                    EntryPayload::Data(data) => {
                        self.state_machine.apply(index, &data).await;
                    }
                    EntryPayload::ServerConfig(servers) => {
                        self.apply_server_config(servers);
                        let matches_in_flight = self
                            .membership
                            .in_flight()
                            .map(|f| f.config_entry_index == Some(index))
                            .unwrap_or(false);
                        if matches_in_flight && self.membership.finish_in_flight().is_some() {
                            self.resolve_membership_reply(ServerOpStatus::Success).await;
                        }
                    }
                }
            }
            self.last_applied = index;
        }
    }

    fn apply_server_config(&mut self, servers: ServerAddressMap) {
        let was_member = servers.contains_key(&self.id);
        self.servers.set_configured(
            servers
                .iter()
                .map(|(id, addr)| PeerInfo {
                    id: *id,
                    address: addr.clone(),
                }),
        );
        if was_member {
            self.joining = false;
        }
        self.log.prev_servers = servers;
    }

    // ---- client commands (§4.6) -----------------------------------------

    async fn handle_api(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::ClientWrite { data, tx } => self.handle_client_write(data, tx).await,
            RaftMsg::AddServer {
                server_id,
                address,
                tx,
            } => {
                self.begin_add_server(server_id, address, MembershipReply::Local(tx))
                    .await;
            }
            RaftMsg::RemoveServer { server_id, tx } => {
                self.begin_remove_server(server_id, MembershipReply::Local(tx))
                    .await;
            }
            RaftMsg::InitializeCluster { tx } => {
                let result = self.initialize_cluster();
                let _ = tx.send(result);
            }
            RaftMsg::TakeLeadership => {
                if self.state != State::Leader {
                    self.on_election_timeout().await;
                }
            }
            RaftMsg::BeginJoin {
                remote_addresses,
                expected_cluster_id,
            } => {
                self.expected_cluster_id = expected_cluster_id;
                self.begin_join(remote_addresses).await;
            }
        }
    }

    /// Dial every address in `remote_addresses` with an `AddServerRequest`
    /// handshake (§4.3): this server does not yet know any peer's id, only
    /// where to reach one, so the handshake goes out address-addressed
    /// rather than through the ordinary id-keyed `network.send` (§6.3 `join`).
    async fn begin_join(&mut self, remote_addresses: Vec<String>) {
        let envelope = self.envelope(
            None,
            RpcBody::AddServerRequest(crate::codec::AddServerRequest {
                server_id: self.id,
                address: self.local_address.clone(),
            }),
        );
        for address in remote_addresses {
            self.network.dial(&address, envelope.clone()).await;
        }
    }

    fn initialize_cluster(&mut self) -> RaftResult<()> {
        if self.cluster_id.is_some() {
            return Err(RaftError::State(StateError::ReconfigurationInProgress));
        }
        let cluster_id = ClusterId(uuid::Uuid::new_v4());
        self.cluster_id = Some(cluster_id);
        self.joining = false;
        self.current_term = 1;
        self.state = State::Leader;
        self.current_leader = Some(self.id);
        self.servers.set_configured(vec![PeerInfo {
            id: self.id,
            address: self.local_address.clone(),
        }]);
        self.log.prev_servers = std::iter::once((self.id, self.local_address.clone())).collect();
        // The initial term lives in the snapshot's `prev_term` rather than a
        // separate `State` record, so `current_term` survives a restart even
        // if no command is ever proposed (§3 invariant 3).
        self.log.prev_term = self.current_term;

        // Write the two records every log file must carry exactly once,
        // in order, before any appended entry (§6.1). The one-server
        // membership lives in the snapshot's `prev_servers` so a restart can
        // reconstruct it without a `ServerConfig` log entry (§4.9).
        self.durability.request(Record::Header {
            cluster_id: cluster_id.0,
            server_id: self.id.0,
        });
        self.durability.request(Record::Snapshot {
            prev_term: self.log.prev_term,
            prev_index: self.log.prev_index(),
            prev_servers: self.log.prev_servers.clone(),
            data: self.log.snapshot_data.clone(),
        });
        Ok(())
    }

    async fn handle_client_write(
        &mut self,
        data: Vec<u8>,
        tx: oneshot::Sender<RaftResult<CommandStatus>>,
    ) {
        if self.state != State::Leader {
            let _ = tx.send(Ok(CommandStatus::NotLeader));
            return;
        }
        if self.log_failed {
            let _ = tx.send(Ok(CommandStatus::Shutdown));
            return;
        }
        let term = self.current_term;
        self.log.append(LogEntry {
            term,
            payload: EntryPayload::Data(data.clone()),
        });
        let index = self.log.log_end() - 1;
        let seq = self.durability.request(Record::Entry {
            term,
            index,
            payload: EntryPayload::Data(data),
        });
        self.defer_self_match_until_durable(seq, index);
        let (_id, rx) = self.commands.track(index, term);
        self.advance_commit_index();
        self.apply_committed().await;
        tokio::spawn(async move {
            let status = rx.await.unwrap_or(CommandStatus::Shutdown);
            let _ = tx.send(Ok(status));
        });
    }

    // ---- membership (§4.7) -----------------------------------------------

    /// Begin adding `server_id` (§4.7). The reply to `reply` is sent right
    /// away for an immediate outcome, or deferred in `self.membership_reply`
    /// until the `ServerConfig` entry commits, leadership is lost, or a
    /// conflicting request cancels it.
    async fn begin_add_server(
        &mut self,
        server_id: ServerId,
        address: String,
        reply: MembershipReply,
    ) {
        if self.state != State::Leader {
            self.send_membership_reply(reply, ServerOpStatus::NotLeader).await;
            return;
        }
        let already_member = self.servers.is_configured(server_id);
        match self
            .membership
            .begin_add(server_id, address.clone(), already_member)
        {
            ReconfigOutcome::Immediate(status) => {
                self.send_membership_reply(reply, status).await;
            }
            ReconfigOutcome::Deferred => {
                self.servers.note_ad_hoc(PeerInfo {
                    id: server_id,
                    address,
                });
                self.replication.insert(server_id, self.log.log_end());
                self.membership_reply = Some(reply);
            }
        }
    }

    async fn begin_remove_server(&mut self, server_id: ServerId, reply: MembershipReply) {
        if self.state != State::Leader {
            self.send_membership_reply(reply, ServerOpStatus::NotLeader).await;
            return;
        }
        let is_member = self.servers.is_configured(server_id);
        if is_member {
            let remaining_voters = self
                .servers
                .configured_ids()
                .filter(|id| {
                    *id != server_id && self.membership.phase_of(*id) != ServerPhase::Remove
                })
                .count();
            if remaining_voters == 0 {
                self.send_membership_reply(reply, ServerOpStatus::Empty).await;
                return;
            }
        }
        match self.membership.begin_remove(server_id, is_member) {
            ReconfigOutcome::Immediate(status) => {
                self.send_membership_reply(reply, status).await;
            }
            ReconfigOutcome::Deferred => {
                self.membership_reply = Some(reply);
                let mut new_servers: ServerAddressMap = self.log.prev_servers.clone();
                for peer in self.servers.configured() {
                    if peer.id != server_id {
                        new_servers.insert(peer.id, peer.address.clone());
                    }
                }
                let term = self.current_term;
                self.log.append(LogEntry {
                    term,
                    payload: EntryPayload::ServerConfig(new_servers.clone()),
                });
                let index = self.log.log_end() - 1;
                let seq = self.durability.request(Record::Entry {
                    term,
                    index,
                    payload: EntryPayload::ServerConfig(new_servers),
                });
                self.defer_self_match_until_durable(seq, index);
                self.membership.mark_committing(index);
                self.advance_commit_index();
                self.apply_committed().await;
            }
        }
    }

    fn maybe_finalize_membership(&mut self) {
        let in_flight = match self.membership.in_flight() {
            Some(f) => f.target,
            None => return,
        };
        let caught_up = matches!(self.membership.phase_of(in_flight), ServerPhase::CaughtUp);
        let already_committing = self
            .membership
            .in_flight()
            .and_then(|f| f.config_entry_index)
            .is_some();
        if caught_up && !already_committing && self.state == State::Leader {
            let mut new_servers: ServerAddressMap = self.log.prev_servers.clone();
            for peer in self.servers.configured() {
                new_servers.insert(peer.id, peer.address.clone());
            }
            if let Some(address) = self.servers.address_of(in_flight) {
                new_servers.insert(in_flight, address.to_string());
            }
            let term = self.current_term;
            self.log.append(LogEntry {
                term,
                payload: EntryPayload::ServerConfig(new_servers.clone()),
            });
            let index = self.log.log_end() - 1;
            let seq = self.durability.request(Record::Entry {
                term,
                index,
                payload: EntryPayload::ServerConfig(new_servers),
            });
            self.defer_self_match_until_durable(seq, index);
            self.membership.mark_committing(index);
        }
    }

    // ---- snapshot install (§4.8) -----------------------------------------

    async fn begin_snapshot_stream(&mut self, peer: ServerId) {
        let data = self
            .log
            .snapshot_data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).to_string())
            .unwrap_or_default();
        let stream = SnapshotStream::new(
            self.log.prev_term,
            self.log.prev_index(),
            self.log.prev_servers.clone(),
            data,
        );
        self.snapshot_streams.insert(peer, stream);
        self.continue_snapshot_stream(peer).await;
    }

    async fn continue_snapshot_stream(&mut self, peer: ServerId) {
        let req = match self.snapshot_streams.get(&peer) {
            Some(s) => s.next_request(self.current_term, self.config.max_snapshot_chunk_size as usize),
            None => return,
        };
        let envelope = self.envelope(Some(peer), RpcBody::InstallSnapshotRequest(req));
        self.network.send(peer, envelope).await;
    }

    async fn handle_install_snapshot_request(&mut self, from: ServerId, req: InstallSnapshotRequest) {
        self.observe_term(req.term).await;
        if req.term < self.current_term {
            return;
        }
        self.current_leader = Some(from);
        self.state = State::Follower;
        self.reset_election_timer();

        if req.offset == 0 {
            self.snapshot_receiver = Some(SnapshotReceiver::new());
        }
        let receiver = match self.snapshot_receiver.as_mut() {
            Some(r) => r,
            None => return,
        };
        let outcome = receiver.feed(&req);
        let offset_received = match outcome {
            ReceiveOutcome::Accepted { offset_received } => offset_received,
            ReceiveOutcome::Mismatch { offset_received } => offset_received,
        };

        if req.done && matches!(outcome, ReceiveOutcome::Accepted { .. }) {
            let buffer = self.snapshot_receiver.take().unwrap().buffer;
            self.state_machine.restore(buffer.as_bytes()).await;
            self.log = LogStore::from_prefix(
                req.last_index + 1,
                req.last_term,
                req.last_servers.clone(),
                Some(buffer.into_bytes()),
            );
            self.apply_server_config(req.last_servers);
            self.commit_index = self.commit_index.max(req.last_index);
            self.last_applied = self.last_applied.max(req.last_index);
        }

        let reply = self.envelope(
            Some(from),
            RpcBody::InstallSnapshotReply(InstallSnapshotReply {
                term: self.current_term,
                offset_received,
            }),
        );
        self.network.send(from, reply).await;
    }

    async fn handle_install_snapshot_reply(&mut self, from: ServerId, reply: InstallSnapshotReply) {
        self.observe_term(reply.term).await;
        if self.state != State::Leader {
            return;
        }
        let done = {
            let stream = match self.snapshot_streams.get_mut(&from) {
                Some(s) => s,
                None => return,
            };
            stream.advance(reply.offset_received);
            stream.is_done()
        };
        if done {
            let last_index = self
                .snapshot_streams
                .get(&from)
                .map(|s| s.last_index)
                .unwrap_or(0);
            self.snapshot_streams.remove(&from);
            if let Some(p) = self.replication.get_mut(from) {
                p.next_index = last_index + 1;
                p.match_index = last_index;
            }
        } else {
            self.continue_snapshot_stream(from).await;
        }
    }
}
