//! The public handle applications hold onto: `Raft` wraps an `Arc` around
//! the channels that talk to the single `RaftCore` event loop task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec::Envelope;
use crate::config::Config;
use crate::core::RaftCore;
use crate::core::RaftMsg;
use crate::error::CommandStatus;
use crate::error::RaftResult;
use crate::error::ServerOpStatus;
use crate::log::RecordLog;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::raft_types::ClusterId;
use crate::raft_types::ServerId;
use crate::state_machine::StateMachine;

struct RaftInner {
    id: ServerId,
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    tx_rpc: mpsc::UnboundedSender<Envelope>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A cheaply-cloneable handle to a running Raft node.
///
/// Holds no protocol state itself: every method sends a message to the
/// node's event loop task and awaits its reply.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Spawn a new node's event loop task and return a handle to it.
    ///
    /// `local_address` is this server's own dial string (`"tcp:host[:port]"`),
    /// recorded into the membership set if/when `initialize` bootstraps a
    /// fresh one-server cluster (§3, §6.3).
    pub fn new<N, L, M>(
        id: ServerId,
        local_address: String,
        config: Config,
        network: Arc<N>,
        state_machine: Arc<M>,
        log: L,
    ) -> Self
    where
        N: RaftNetwork,
        L: RecordLog,
        M: StateMachine,
    {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_rpc, rx_rpc) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));

        let core = RaftCore::new(
            id,
            local_address,
            config,
            network,
            state_machine,
            log,
            rx_api,
            rx_rpc,
            tx_metrics,
        );
        let join_handle = tokio::spawn(core.run());

        Self {
            inner: Arc::new(RaftInner {
                id,
                tx_api,
                tx_rpc,
                rx_metrics,
                join_handle: Mutex::new(Some(join_handle)),
            }),
        }
    }

    /// Join an existing cluster by dialing each of `remote_addresses` with
    /// an `AddServerRequest` handshake, rather than bootstrapping a new
    /// one-server cluster (§4.3, §6.3 `join`). `expected_cluster_id`, if
    /// given, is checked against whichever cluster id this server first
    /// learns of; a mismatch is rejected instead of adopted.
    #[allow(clippy::too_many_arguments)]
    pub fn join<N, L, M>(
        id: ServerId,
        local_address: String,
        config: Config,
        network: Arc<N>,
        state_machine: Arc<M>,
        log: L,
        remote_addresses: Vec<String>,
        expected_cluster_id: Option<ClusterId>,
    ) -> Self
    where
        N: RaftNetwork,
        L: RecordLog,
        M: StateMachine,
    {
        let raft = Self::new(id, local_address, config, network, state_machine, log);
        let _ = raft.inner.tx_api.send(RaftMsg::BeginJoin {
            remote_addresses,
            expected_cluster_id,
        });
        raft
    }

    pub fn id(&self) -> ServerId {
        self.inner.id
    }

    /// This server's own id (`raft_get_sid` in the original C interface).
    pub fn server_id(&self) -> ServerId {
        self.inner.id
    }

    /// The cluster id, once known (learned on `initialize` or on first
    /// contact with the cluster when joining). `None` before then
    /// (`raft_get_cid`).
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.inner.rx_metrics.borrow().cluster_id
    }

    /// Whether this server is still catching up and not yet a committed
    /// member of the configuration (`raft_is_joining`; §9 Design Note: only
    /// cleared once a committed `ServerConfig` entry lists this server).
    pub fn is_joining(&self) -> bool {
        self.inner.rx_metrics.borrow().joining
    }

    /// Deliver an inbound envelope from the network collaborator.
    pub fn receive(&self, envelope: Envelope) {
        let _ = self.inner.tx_rpc.send(envelope);
    }

    /// Create a brand new single-server cluster rooted at this node (§3).
    pub async fn initialize(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.tx_api.send(RaftMsg::InitializeCluster { tx });
        rx.await.map_err(|_| crate::error::RaftError::ShuttingDown)?
    }

    /// Propose `data` as a new log entry, resolving once its commit status
    /// is known (§4.6).
    pub async fn client_write(&self, data: Vec<u8>) -> RaftResult<CommandStatus> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.tx_api.send(RaftMsg::ClientWrite { data, tx });
        rx.await.map_err(|_| crate::error::RaftError::ShuttingDown)?
    }

    /// Ask this server (forwarding to the leader is the caller's/network's
    /// job if this reports `NotLeader`) to add `server_id` at `address`
    /// (§4.7).
    pub async fn add_server(&self, server_id: ServerId, address: String) -> ServerOpStatus {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.tx_api.send(RaftMsg::AddServer {
            server_id,
            address,
            tx,
        });
        rx.await.unwrap_or(ServerOpStatus::NotLeader)
    }

    /// Ask this server to remove `server_id` (§4.7).
    pub async fn remove_server(&self, server_id: ServerId) -> ServerOpStatus {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.tx_api.send(RaftMsg::RemoveServer { server_id, tx });
        rx.await.unwrap_or(ServerOpStatus::NotLeader)
    }

    /// Force this server to start an election if it is not already leader
    /// (§6.3).
    pub fn take_leadership(&self) {
        let _ = self.inner.tx_api.send(RaftMsg::TakeLeadership);
    }

    /// The current metrics snapshot.
    pub fn metrics(&self) -> RaftMetrics {
        self.inner.rx_metrics.borrow().clone()
    }

    /// Build a `Wait` handle for blocking (with a timeout) on a metrics
    /// predicate.
    pub fn wait(&self, timeout: Duration) -> Wait {
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Stop the node gracefully: every pending command fails with
    /// `Shutdown`, and the fsync worker is joined before this returns
    /// (§6.3 `close`).
    pub async fn close(&self) {
        let _ = self.inner.tx_api.send(RaftMsg::Shutdown);
        let mut guard = self.inner.join_handle.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle.await;
        }
    }
}
