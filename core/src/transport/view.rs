// Shared view of the swarm's addresses and connections
//
// The swarm task is the only writer. Readers (reservation polling, the
// session handler) take snapshots without a round trip through the swarm.

use crate::relay::client::AddressSource;
use libp2p::core::ConnectedPoint;
use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ViewInner {
    listen_addrs: Vec<Multiaddr>,
    /// Per connection: whether it runs through a relay
    connections: HashMap<PeerId, HashMap<ConnectionId, bool>>,
    /// Why the last reservation attempt on a relay failed
    relay_failures: HashMap<PeerId, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkView {
    inner: Arc<RwLock<ViewInner>>,
}

impl NetworkView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listen_addr(&self, address: Multiaddr) {
        let mut inner = self.inner.write();
        if !inner.listen_addrs.contains(&address) {
            inner.listen_addrs.push(address);
        }
    }

    pub fn remove_listen_addr(&self, address: &Multiaddr) {
        self.inner.write().listen_addrs.retain(|a| a != address);
    }

    pub fn connection_opened(&self, peer: PeerId, id: ConnectionId, endpoint: &ConnectedPoint) {
        self.inner
            .write()
            .connections
            .entry(peer)
            .or_default()
            .insert(id, endpoint.is_relayed());
    }

    pub fn connection_closed(&self, peer: &PeerId, id: &ConnectionId) {
        let mut inner = self.inner.write();
        if let Some(conns) = inner.connections.get_mut(peer) {
            conns.remove(id);
            if conns.is_empty() {
                inner.connections.remove(peer);
            }
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.read().connections.contains_key(peer)
    }

    /// True when `peer` is connected and every connection runs through a relay
    pub fn is_limited(&self, peer: &PeerId) -> bool {
        self.inner
            .read()
            .connections
            .get(peer)
            .is_some_and(|conns| !conns.is_empty() && conns.values().all(|relayed| *relayed))
    }

    /// Remember that reserving on `relay` failed (dial error or listener closed)
    pub fn relay_failed(&self, relay: PeerId, reason: String) {
        self.inner.write().relay_failures.insert(relay, reason);
    }

    /// Forget an earlier failure before a new attempt
    pub fn clear_relay_failure(&self, relay: &PeerId) {
        self.inner.write().relay_failures.remove(relay);
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.read().connections.keys().copied().collect()
    }

    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.inner.read().listen_addrs.clone()
    }
}

impl AddressSource for NetworkView {
    fn listen_addresses(&self) -> Vec<Multiaddr> {
        NetworkView::listen_addresses(self)
    }

    fn relay_failure(&self, relay: &PeerId) -> Option<String> {
        self.inner.read().relay_failures.get(relay).cloned()
    }
}
