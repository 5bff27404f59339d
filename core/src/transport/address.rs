// Multiaddr helpers for relay circuit addresses
//
// Circuit form: /<transport...>/p2p/<relay-id>/p2p-circuit/p2p/<target-id>

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

/// Textual separator in front of every peer identity segment
pub const P2P_SEPARATOR: &str = "/p2p/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid multiaddr {input:?}: {reason}")]
    Malformed { input: String, reason: String },
    #[error("Invalid multiaddr {0:?}: missing /p2p/<peerId>")]
    MissingPeerId(String),
    #[error("Invalid peer id {0:?}")]
    InvalidPeerId(String),
}

/// A dial target extracted from address text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub peer_id: PeerId,
    pub address: Multiaddr,
}

impl DialTarget {
    /// Parse address text and take the last `/p2p/` segment as the target identity
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        let address: Multiaddr = text.parse().map_err(|e: libp2p::multiaddr::Error| {
            AddressError::Malformed {
                input: text.to_string(),
                reason: e.to_string(),
            }
        })?;
        let peer_id = target_peer_id(&address)?;
        Ok(Self { peer_id, address })
    }

    /// Whether the target is only reachable through a relay
    pub fn is_circuit(&self) -> bool {
        is_circuit(&self.address)
    }
}

/// Extract the trailing target identity from an address.
///
/// Splits the textual form on `/p2p/` and parses the last segment.
pub fn target_peer_id(address: &Multiaddr) -> Result<PeerId, AddressError> {
    let text = address.to_string();
    let segments: Vec<&str> = text.split(P2P_SEPARATOR).collect();
    if segments.len() < 2 {
        return Err(AddressError::MissingPeerId(text));
    }
    let last = segments[segments.len() - 1];
    let id = last.split('/').next().unwrap_or_default();
    id.parse::<PeerId>()
        .map_err(|_| AddressError::InvalidPeerId(id.to_string()))
}

/// Whether the address routes through a relay hop
pub fn is_circuit(address: &Multiaddr) -> bool {
    address.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// The relay identity in front of the `p2p-circuit` hop, if any
pub fn relay_peer_id(address: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for protocol in address.iter() {
        match protocol {
            Protocol::P2p(peer) => last_peer = Some(peer),
            Protocol::P2pCircuit => return last_peer,
            _ => {}
        }
    }
    None
}

/// Host component (ip4, ip6 or dns name) rendered as text
pub fn host_of(address: &Multiaddr) -> Option<String> {
    address.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(ip.to_string()),
        Protocol::Ip6(ip) => Some(ip.to_string()),
        Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
            Some(name.to_string())
        }
        _ => None,
    })
}

/// `<relay>/p2p-circuit`, the address a node listens on to obtain a reservation
pub fn circuit_listen_address(relay: &Multiaddr) -> Multiaddr {
    relay.clone().with(Protocol::P2pCircuit)
}

/// Append `/p2p/<peer>` unless the address already ends with it
pub fn with_peer(address: Multiaddr, peer: PeerId) -> Multiaddr {
    let already_tagged = matches!(address.iter().last(), Some(Protocol::P2p(existing)) if existing == peer);
    if already_tagged {
        address
    } else {
        address.with(Protocol::P2p(peer))
    }
}

/// Whether `address` is a circuit address through `relay` that ends in `target`
pub fn is_circuit_for(address: &Multiaddr, relay: Option<PeerId>, target: PeerId) -> bool {
    if !is_circuit(address) {
        return false;
    }
    if !matches!(address.iter().last(), Some(Protocol::P2p(peer)) if peer == target) {
        return false;
    }
    match relay {
        Some(relay) => relay_peer_id(address) == Some(relay),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(relay: PeerId, target: PeerId) -> String {
        format!("/ip4/13.60.15.36/tcp/3001/ws/p2p/{relay}/p2p-circuit/p2p/{target}")
    }

    #[test]
    fn test_parse_circuit_target() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let parsed = DialTarget::parse(&circuit(relay, target)).unwrap();
        assert_eq!(parsed.peer_id, target);
        assert!(parsed.is_circuit());
        assert_eq!(relay_peer_id(&parsed.address), Some(relay));
    }

    #[test]
    fn test_parse_direct_target() {
        let target = PeerId::random();
        let parsed = DialTarget::parse(&format!("/ip4/1.2.3.4/tcp/1/p2p/{target}")).unwrap();
        assert_eq!(parsed.peer_id, target);
        assert!(!parsed.is_circuit());
        assert_eq!(relay_peer_id(&parsed.address), None);
    }

    #[test]
    fn test_missing_peer_id() {
        let err = DialTarget::parse("/ip4/1.2.3.4/tcp/1").unwrap_err();
        assert!(matches!(err, AddressError::MissingPeerId(_)));
    }

    #[test]
    fn test_malformed_text() {
        let err = DialTarget::parse("not-an-address").unwrap_err();
        assert!(matches!(err, AddressError::Malformed { .. }));
    }

    #[test]
    fn test_host_of() {
        let ip: Multiaddr = "/ip4/13.60.15.36/tcp/3001/ws".parse().unwrap();
        assert_eq!(host_of(&ip).as_deref(), Some("13.60.15.36"));
        let dns: Multiaddr = "/dns4/relay.example.org/tcp/443/wss".parse().unwrap();
        assert_eq!(host_of(&dns).as_deref(), Some("relay.example.org"));
    }

    #[test]
    fn test_is_circuit_for() {
        let relay = PeerId::random();
        let me = PeerId::random();
        let addr: Multiaddr = circuit(relay, me).parse().unwrap();
        assert!(is_circuit_for(&addr, Some(relay), me));
        assert!(is_circuit_for(&addr, None, me));
        assert!(!is_circuit_for(&addr, Some(PeerId::random()), me));
        assert!(!is_circuit_for(&addr, Some(relay), PeerId::random()));
    }

    #[test]
    fn test_with_peer_does_not_duplicate() {
        let me = PeerId::random();
        let base: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        let once = with_peer(base, me);
        let twice = with_peer(once.clone(), me);
        assert_eq!(once, twice);
    }
}
