// Address gate — relay-only outbound policy
//
// Every outbound dial must either go through a relay hop (`p2p-circuit`) or
// target one of the configured relay hosts. Anything else would let the
// transport open a direct connection and expose the node's real address.

use super::address::{host_of, is_circuit};
use libp2p::core::transport::PortUse;
use libp2p::core::Endpoint;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
    THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{Multiaddr, PeerId};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::task::{Context, Poll};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Address {0} is neither a relay circuit nor a configured relay")]
    Rejected(Multiaddr),
}

/// Outbound address policy
#[derive(Debug, Clone, Default)]
pub struct AddressGate {
    relay_hosts: HashSet<String>,
}

impl AddressGate {
    /// Gate that only allows circuits and the hosts of the given relays
    pub fn for_relays<'a>(relays: impl IntoIterator<Item = &'a Multiaddr>) -> Self {
        Self {
            relay_hosts: relays.into_iter().filter_map(host_of).collect(),
        }
    }

    /// Gate from a list of relay host identifiers (IP literals or DNS names)
    pub fn with_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relay_hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn relay_hosts(&self) -> impl Iterator<Item = &str> {
        self.relay_hosts.iter().map(String::as_str)
    }

    /// Whether an outbound connection to `address` is permitted
    pub fn permit(&self, address: &Multiaddr) -> bool {
        if is_circuit(address) {
            return true;
        }
        host_of(address).is_some_and(|host| self.relay_hosts.contains(&host))
    }

    /// [`AddressGate::permit`] as a `Result`
    pub fn check(&self, address: &Multiaddr) -> Result<(), GateError> {
        if self.permit(address) {
            Ok(())
        } else {
            Err(GateError::Rejected(address.clone()))
        }
    }
}

/// Network behaviour enforcing the [`AddressGate`] inside the swarm.
///
/// It doubles as the dialer's address book: addresses patched in for a peer
/// are handed to the swarm when a dial by `PeerId` needs to resolve them.
pub struct GateBehaviour {
    gate: AddressGate,
    book: HashMap<PeerId, Vec<Multiaddr>>,
}

impl GateBehaviour {
    pub fn new(gate: AddressGate) -> Self {
        Self {
            gate,
            book: HashMap::new(),
        }
    }

    pub fn gate(&self) -> &AddressGate {
        &self.gate
    }

    /// Associate `peer` with `addresses` so that dials by peer id resolve.
    /// Addresses the gate would refuse are dropped.
    pub fn patch(&mut self, peer: PeerId, addresses: Vec<Multiaddr>) {
        let entry = self.book.entry(peer).or_default();
        for address in addresses {
            if !self.gate.permit(&address) {
                tracing::warn!("Not recording gated address {} for {}", address, peer);
                continue;
            }
            if !entry.contains(&address) {
                entry.push(address);
            }
        }
    }

    /// Addresses known for `peer`
    pub fn addresses_of(&self, peer: &PeerId) -> &[Multiaddr] {
        self.book.get(peer).map(Vec::as_slice).unwrap_or_default()
    }
}

impl NetworkBehaviour for GateBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        if let Some(denied) = addresses.iter().find(|a| !self.gate.permit(a)) {
            tracing::warn!("Gate denied dial to {}", denied);
            return Err(ConnectionDenied::new(GateError::Rejected(denied.clone())));
        }

        Ok(maybe_peer
            .map(|peer| self.addresses_of(&peer).to_vec())
            .unwrap_or_default())
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        if !self.gate.permit(addr) {
            tracing::warn!("Gate closed connection to {} via {}", peer, addr);
            return Err(ConnectionDenied::new(GateError::Rejected(addr.clone())));
        }
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RELAY_HOST: &str = "13.60.15.36";

    fn gate() -> AddressGate {
        let relay: Multiaddr = format!("/ip4/{RELAY_HOST}/tcp/3001/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        AddressGate::for_relays([&relay])
    }

    #[test]
    fn test_rejects_direct_address() {
        let addr: Multiaddr = format!("/ip4/8.8.8.8/tcp/80/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        assert!(!gate().permit(&addr));
        assert_eq!(gate().check(&addr), Err(GateError::Rejected(addr)));
    }

    #[test]
    fn test_permits_relay_host() {
        let addr: Multiaddr = format!("/ip4/{RELAY_HOST}/tcp/3001/ws").parse().unwrap();
        assert!(gate().permit(&addr));
    }

    #[test]
    fn test_permits_any_circuit() {
        let addr: Multiaddr = format!(
            "/ip4/9.9.9.9/tcp/1/p2p/{}/p2p-circuit/p2p/{}",
            PeerId::random(),
            PeerId::random()
        )
        .parse()
        .unwrap();
        assert!(gate().permit(&addr));
    }

    #[test]
    fn test_empty_gate_only_permits_circuits() {
        let gate = AddressGate::default();
        let direct: Multiaddr = format!("/ip4/{RELAY_HOST}/tcp/3001").parse().unwrap();
        assert!(!gate.permit(&direct));
        assert!(gate.permit(&direct.with(libp2p::multiaddr::Protocol::P2pCircuit)));
    }

    #[test]
    fn test_patch_drops_gated_addresses() {
        let mut behaviour = GateBehaviour::new(gate());
        let peer = PeerId::random();
        let direct: Multiaddr = "/ip4/8.8.8.8/tcp/80".parse().unwrap();
        let circuit: Multiaddr = format!("/ip4/{RELAY_HOST}/tcp/3001/ws/p2p-circuit/p2p/{peer}")
            .parse()
            .unwrap();

        behaviour.patch(peer, vec![direct, circuit.clone(), circuit.clone()]);
        assert_eq!(behaviour.addresses_of(&peer), &[circuit]);
        assert!(behaviour.addresses_of(&PeerId::random()).is_empty());
    }

    #[test]
    fn test_pending_dial_denied_for_direct_address() {
        let mut behaviour = GateBehaviour::new(gate());
        let direct: Multiaddr = "/ip4/8.8.8.8/tcp/80".parse().unwrap();
        let result = behaviour.handle_pending_outbound_connection(
            ConnectionId::new_unchecked(1),
            None,
            &[direct],
            Endpoint::Dialer,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pending_dial_resolves_book_addresses() {
        let mut behaviour = GateBehaviour::new(gate());
        let peer = PeerId::random();
        let circuit: Multiaddr = format!("/ip4/{RELAY_HOST}/tcp/3001/ws/p2p-circuit/p2p/{peer}")
            .parse()
            .unwrap();
        behaviour.patch(peer, vec![circuit.clone()]);

        let resolved = behaviour
            .handle_pending_outbound_connection(
                ConnectionId::new_unchecked(2),
                Some(peer),
                &[],
                Endpoint::Dialer,
            )
            .unwrap();
        assert_eq!(resolved, vec![circuit]);
    }

    fn arb_ip4() -> impl Strategy<Value = [u8; 4]> {
        prop_oneof![
            Just([13u8, 60, 15, 36]),
            any::<[u8; 4]>(),
        ]
    }

    proptest! {
        #[test]
        fn prop_permit_iff_circuit_or_relay_host(
            octets in arb_ip4(),
            port in 1u16..,
            ws in any::<bool>(),
            circuit in any::<bool>(),
        ) {
            let host = std::net::Ipv4Addr::from(octets);
            let mut text = format!("/ip4/{host}/tcp/{port}");
            if ws {
                text.push_str("/ws");
            }
            text.push_str(&format!("/p2p/{}", PeerId::random()));
            if circuit {
                text.push_str(&format!("/p2p-circuit/p2p/{}", PeerId::random()));
            }
            let addr: Multiaddr = text.parse().unwrap();

            let expected = text.contains("p2p-circuit") || host.to_string() == RELAY_HOST;
            prop_assert_eq!(gate().permit(&addr), expected);
        }
    }
}
