//! Circuit relay v2: the public relay service and the client-side
//! reservation manager.
//!
//! Peers behind NAT never accept direct connections. They reserve a slot on
//! a relay and are reached at `<relay>/p2p-circuit/p2p/<peer>`.

pub mod client;
pub mod reservation;
pub mod server;

pub use client::{AddressSource, ReservationError, ReservationManager};
pub use reservation::{RelayError, RelayStats, Reservation, ReservationTable, TableLimits};
pub use server::{start_relay, RelayBehaviour, RelayConfig, RelayHandle};
