// Circuitline core — relay-mediated sessions between peers behind NAT
//
// Two peers that cannot reach each other directly each reserve a slot on a
// public relay, then exchange a line-oriented byte stream over a circuit
// through it. Nothing ever dials a peer directly.

pub mod config;
pub mod identity;
pub mod node;
pub mod relay;
pub mod session;
pub mod transport;

pub use config::{
    ConnectionLimitsConfig, DialOptions, InboundLimits, NodeConfig, ReservationConfig,
    DEFAULT_PROTOCOL,
};
pub use identity::{IdentityManager, IdentityStore, NodeKeys};
pub use node::PeerNode;
pub use relay::{
    start_relay, RelayConfig, RelayError, RelayHandle, RelayStats, ReservationError,
    ReservationManager,
};
pub use session::{
    ConsoleCommand, Direction, InputBus, SessionError, SessionId, SessionInfo, SessionOutput,
    SessionState, Termination,
};
pub use transport::{AddressError, AddressGate, DialTarget, GateError};

// Re-exported so front ends need not depend on libp2p for addressing
pub use libp2p::{Multiaddr, PeerId};
