// Combined NetworkBehaviour for a NATed peer
//
// - relay client: reservations and circuits through the public relay
// - gate: relay-only outbound policy plus the dial address book
// - identify: exchange listen/observed addresses with the relay
// - ping: keep the relay connection alive
// - streams: the application protocol's raw streams
// - limits: caps on established and pending connections

use super::gate::{AddressGate, GateBehaviour};
use libp2p::{connection_limits, identify, ping, relay, swarm::NetworkBehaviour};
use std::time::Duration;

/// Identify protocol version understood by the deployed relays
pub const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

pub fn agent_version() -> String {
    format!("circuitline/{}", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn identify_behaviour(keypair: &libp2p::identity::Keypair) -> identify::Behaviour {
    identify::Behaviour::new(
        identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
            .with_agent_version(agent_version())
            .with_interval(Duration::from_secs(60))
            // Dial addresses come only from the gate's address book
            .with_cache_size(0),
    )
}

#[derive(NetworkBehaviour)]
pub struct PeerBehaviour {
    pub relay_client: relay::client::Behaviour,
    pub gate: GateBehaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub streams: libp2p_stream::Behaviour,
    pub limits: connection_limits::Behaviour,
}

impl PeerBehaviour {
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        relay_client: relay::client::Behaviour,
        gate: AddressGate,
        limits: connection_limits::ConnectionLimits,
    ) -> Self {
        Self {
            relay_client,
            gate: GateBehaviour::new(gate),
            identify: identify_behaviour(keypair),
            ping: ping::Behaviour::new(ping::Config::new()),
            streams: libp2p_stream::Behaviour::new(),
            limits: connection_limits::Behaviour::new(limits),
        }
    }
}
