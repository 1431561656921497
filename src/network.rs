//! The network collaborator: sending envelopes to peers, and the registry of
//! configured and ad-hoc connections (§4.2, §4.3).

use async_trait::async_trait;

use crate::codec::Envelope;
use crate::raft_types::ServerId;

/// The transport collaborator `RaftCore` sends outbound messages through.
///
/// Delivery is fire-and-forget and unordered across calls: the protocol
/// tolerates drops, reordering and duplication (§4 preamble). Implementations
/// own reconnection; `RaftCore` only ever calls `send`.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send `envelope` toward `target`, best-effort.
    async fn send(&self, target: ServerId, envelope: Envelope);

    /// Dial `address` directly, before the peer's `ServerId` is known.
    ///
    /// Used only for the handshake a joining server sends on first contact
    /// (`AddServerRequest`) and, on every other (re)connect, the plain
    /// `HelloRequest` that lets the far side learn who is calling (§4.3).
    async fn dial(&self, address: &str, envelope: Envelope);
}

/// One entry in the server set: a configured member's last known address,
/// plus whatever connection-level bookkeeping a `RaftNetwork` impl wants to
/// track is left to that implementation (§4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: ServerId,
    pub address: String,
}

/// The registry of who this server believes is in the cluster, learned from
/// the committed server set plus any ad-hoc connections opened by servers
/// not yet committed as members (e.g. a joining server during `Catchup`,
/// §4.3, §4.7).
#[derive(Debug, Default)]
pub struct ServerSet {
    configured: Vec<PeerInfo>,
    ad_hoc: Vec<PeerInfo>,
}

impl ServerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configured member list, e.g. after a committed
    /// `ServerConfig` entry (§4.7). Any ad-hoc entry that is now configured
    /// is dropped from the ad-hoc list.
    pub fn set_configured<I: IntoIterator<Item = PeerInfo>>(&mut self, peers: I) {
        self.configured = peers.into_iter().collect();
        let configured_ids: std::collections::BTreeSet<_> =
            self.configured.iter().map(|p| p.id).collect();
        self.ad_hoc.retain(|p| !configured_ids.contains(&p.id));
    }

    /// Record an ad-hoc peer learned from an inbound Hello/AddServer request
    /// that is not (yet) a configured member.
    pub fn note_ad_hoc(&mut self, peer: PeerInfo) {
        if self.configured.iter().any(|p| p.id == peer.id) {
            return;
        }
        if let Some(existing) = self.ad_hoc.iter_mut().find(|p| p.id == peer.id) {
            existing.address = peer.address;
        } else {
            self.ad_hoc.push(peer);
        }
    }

    /// Drop an ad-hoc entry, e.g. once its `AddServer` attempt is abandoned.
    pub fn forget_ad_hoc(&mut self, id: ServerId) {
        self.ad_hoc.retain(|p| p.id != id);
    }

    pub fn is_configured(&self, id: ServerId) -> bool {
        self.configured.iter().any(|p| p.id == id)
    }

    pub fn configured(&self) -> &[PeerInfo] {
        &self.configured
    }

    pub fn configured_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.configured.iter().map(|p| p.id)
    }

    pub fn address_of(&self, id: ServerId) -> Option<&str> {
        self.configured
            .iter()
            .chain(self.ad_hoc.iter())
            .find(|p| p.id == id)
            .map(|p| p.address.as_str())
    }
}
