// Transport module — libp2p swarm, relay-only address policy and addressing

pub mod address;
pub mod behaviour;
pub mod gate;
pub mod swarm;
pub mod view;

pub use address::{
    circuit_listen_address, is_circuit, relay_peer_id, target_peer_id, with_peer, AddressError,
    DialTarget,
};
pub use behaviour::{PeerBehaviour, IDENTIFY_PROTOCOL};
pub use gate::{AddressGate, GateBehaviour, GateError};
pub use swarm::{start_peer_swarm, NetworkEvent, PeerSwarm, SwarmCommand, SwarmHandle};
pub use view::NetworkView;
