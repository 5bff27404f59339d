//! Reservation manager — obtain a relay reservation and wait until it shows up
//!
//! The relay client transport reports a new listen address
//! `<relay>/p2p-circuit/p2p/<self>` once the relay has accepted the
//! reservation. Readiness is level-triggered: the node's address set is
//! polled at a fixed interval until that address is present. A refusal
//! shows up as the circuit listener closing (or the relay dial failing),
//! which the swarm records against the relay; polling stops on it.

use crate::config::ReservationConfig;
use crate::transport::address::{circuit_listen_address, is_circuit_for, target_peer_id};
use crate::transport::swarm::SwarmHandle;
use crate::transport::view::NetworkView;
use libp2p::{Multiaddr, PeerId};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Anything that can report this node's current listen addresses
pub trait AddressSource: Send + Sync {
    fn listen_addresses(&self) -> Vec<Multiaddr>;

    /// Why reserving on `relay` failed, if it did
    fn relay_failure(&self, _relay: &PeerId) -> Option<String> {
        None
    }
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("Reservation unavailable: {0}")]
    Unavailable(String),
    #[error("No reservation after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ReservationManager {
    local: PeerId,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl ReservationManager {
    pub fn new(local: PeerId, config: &ReservationConfig) -> Self {
        Self {
            local,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll `source` until it lists a circuit address through `relay` for this node.
    ///
    /// The first check happens one interval after the call. A failure the
    /// source reports for `relay` ends the wait with `Unavailable`.
    pub async fn await_reservation<S>(
        &self,
        source: &S,
        relay: &Multiaddr,
    ) -> Result<Multiaddr, ReservationError>
    where
        S: AddressSource + ?Sized,
    {
        let relay_id = target_peer_id(relay).ok();

        let wait = async {
            let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let found = source
                    .listen_addresses()
                    .into_iter()
                    .find(|addr| is_circuit_for(addr, relay_id, self.local));
                if let Some(addr) = found {
                    return Ok(addr);
                }
                if let Some(reason) = relay_id.and_then(|id| source.relay_failure(&id)) {
                    tracing::warn!("Reservation on {} failed: {}", relay, reason);
                    return Err(ReservationError::Unavailable(reason));
                }
                tracing::trace!("No circuit address through {} yet", relay);
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ReservationError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Connect to `relay`, ask it for a reservation and wait for the circuit address
    pub async fn request_reservation(
        &self,
        swarm: &SwarmHandle,
        view: &NetworkView,
        relay: &Multiaddr,
    ) -> Result<Multiaddr, ReservationError> {
        let relay_id = target_peer_id(relay).map_err(|_| {
            ReservationError::Unavailable(format!(
                "relay address {} must end in /p2p/<relay-id>",
                relay
            ))
        })?;
        view.clear_relay_failure(&relay_id);

        tracing::info!("Connecting to relay {}", relay);
        swarm
            .dial(relay.clone())
            .await
            .map_err(|e| ReservationError::Unavailable(format!("dial {}: {}", relay, e)))?;

        swarm
            .listen(circuit_listen_address(relay))
            .await
            .map_err(|e| ReservationError::Unavailable(format!("listen via {}: {}", relay, e)))?;

        tracing::info!("Waiting for reservation on {}", relay);
        let address = self.await_reservation(view, relay).await?;
        tracing::info!("Reservation active: {}", address);
        Ok(address)
    }
}
