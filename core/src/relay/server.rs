//! Relay service — runs on a publicly reachable node
//!
//! Issues circuit relay v2 reservations to NATed peers and forwards circuits
//! between them. The libp2p relay behaviour does the protocol work; the event
//! loop mirrors its decisions into a [`ReservationTable`].

use super::reservation::{RelayStats, ReservationTable, TableLimits};
use crate::identity::NodeKeys;
use crate::transport::address::with_peer;
use crate::transport::behaviour::identify_behaviour;
use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::{
    identify, noise, ping, relay, swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux,
    Multiaddr, PeerId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often expired reservations are swept from the table
const EXPIRY_SWEEP: Duration = Duration::from_secs(60);

/// Relay service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addrs: Vec<String>,
    /// Public addresses handed to peers in reservations. Empty means the
    /// listen addresses are announced as they are.
    pub announce_addrs: Vec<String>,
    /// `None` accepts any number of reservations
    pub max_reservations: Option<usize>,
    pub max_reservations_per_peer: usize,
    pub reservation_duration_secs: u64,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    pub max_circuit_duration_secs: u64,
    pub max_circuit_bytes: u64,
    /// List reserved peers' circuit addresses
    pub advertise: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/3001/ws".to_string()],
            announce_addrs: Vec::new(),
            max_reservations: None,
            max_reservations_per_peer: 4,
            reservation_duration_secs: 3600,
            max_circuits: 16,
            max_circuits_per_peer: 4,
            max_circuit_duration_secs: 120,
            max_circuit_bytes: 1 << 17,
            advertise: false,
        }
    }
}

impl RelayConfig {
    /// libp2p relay behaviour limits derived from this config
    pub fn to_libp2p(&self) -> relay::Config {
        relay::Config {
            max_reservations: self.max_reservations.unwrap_or(usize::MAX),
            max_reservations_per_peer: self.max_reservations_per_peer,
            reservation_duration: Duration::from_secs(self.reservation_duration_secs),
            max_circuits: self.max_circuits,
            max_circuits_per_peer: self.max_circuits_per_peer,
            max_circuit_duration: Duration::from_secs(self.max_circuit_duration_secs),
            max_circuit_bytes: self.max_circuit_bytes,
            ..relay::Config::default()
        }
    }

    pub fn table_limits(&self) -> TableLimits {
        TableLimits {
            max_reservations: self.max_reservations,
            reservation_duration: Duration::from_secs(self.reservation_duration_secs),
            max_circuits: self.max_circuits,
            max_circuits_per_peer: self.max_circuits_per_peer,
        }
    }

    fn parse(texts: &[String]) -> Result<Vec<Multiaddr>> {
        texts
            .iter()
            .map(|t| {
                t.parse::<Multiaddr>()
                    .with_context(|| format!("Invalid relay address {}", t))
            })
            .collect()
    }
}

#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub relay: relay::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// A running relay service
pub struct RelayHandle {
    peer_id: PeerId,
    table: Arc<RwLock<ReservationTable>>,
    addresses: watch::Receiver<Vec<Multiaddr>>,
    advertised: watch::Receiver<Vec<Multiaddr>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Dialable relay multiaddrs, each ending in `/p2p/<relay-id>`
    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.addresses.borrow().clone()
    }

    /// Wait until the relay reports at least one address
    pub async fn wait_for_addresses(&self) -> Result<Vec<Multiaddr>> {
        let mut rx = self.addresses.clone();
        let addrs = rx
            .wait_for(|addrs| !addrs.is_empty())
            .await
            .context("Relay stopped before listening")?;
        Ok(addrs.clone())
    }

    pub fn stats(&self) -> RelayStats {
        self.table.read().stats()
    }

    /// Circuit addresses of reserved peers (empty unless advertising)
    pub fn advertised_addresses(&self) -> Vec<Multiaddr> {
        self.advertised.borrow().clone()
    }

    /// Follow changes to the advertised circuit addresses
    pub fn watch_advertised(&self) -> watch::Receiver<Vec<Multiaddr>> {
        self.advertised.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Relay task failed: {}", e);
        }
    }
}

/// Build the relay swarm and start serving
pub async fn start_relay(keys: &NodeKeys, config: &RelayConfig) -> Result<RelayHandle> {
    let local_peer_id = keys.peer_id();
    let listen = RelayConfig::parse(&config.listen_addrs)?;
    let announce = RelayConfig::parse(&config.announce_addrs)?;
    let relay_config = config.to_libp2p();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keys.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_dns()?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await?
        .with_behaviour(|key| RelayBehaviour {
            relay: relay::Behaviour::new(key.public().to_peer_id(), relay_config),
            identify: identify_behaviour(key),
            ping: ping::Behaviour::new(ping::Config::new()),
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(300)))
        .build();

    for addr in listen {
        swarm
            .listen_on(addr.clone())
            .with_context(|| format!("Failed to listen on {}", addr))?;
    }

    let announce_listen = announce.is_empty();
    let (addr_tx, addr_rx) = watch::channel(Vec::new());
    let (advertised_tx, advertised_rx) = watch::channel(Vec::new());
    for addr in announce {
        swarm.add_external_address(addr.clone());
        let full = with_peer(addr, local_peer_id);
        addr_tx.send_modify(|addrs| addrs.push(full));
    }

    let table = Arc::new(RwLock::new(ReservationTable::new(
        config.table_limits(),
        config.advertise,
    )));
    let cancel = CancellationToken::new();

    tracing::info!("Relay started as {}", local_peer_id);

    let task_table = table.clone();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let table = task_table;
        let mut sweep = tokio::time::interval(EXPIRY_SWEEP);
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::info!("Relay shutting down");
                    break;
                }

                _ = sweep.tick() => {
                    let expired = table.write().expire(Instant::now());
                    if !expired.is_empty() {
                        tracing::info!("{} reservations expired", expired.len());
                        publish_advertised(&table, &addr_tx.borrow(), &advertised_tx);
                    }
                }

                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        if announce_listen {
                            swarm.add_external_address(address.clone());
                            let full = with_peer(address, local_peer_id);
                            tracing::info!("Relay listening on {}", full);
                            addr_tx.send_modify(|addrs| addrs.push(full));
                        } else {
                            tracing::info!("Relay listening on {}", address);
                        }
                    }

                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        tracing::debug!("Peer {} connected from {}", peer_id, endpoint.get_remote_address());
                    }

                    SwarmEvent::ConnectionClosed { peer_id, num_established: 0, .. } => {
                        if table.write().release(&peer_id).is_some() {
                            tracing::info!("Reservation for {} dropped on disconnect", peer_id);
                            publish_advertised(&table, &addr_tx.borrow(), &advertised_tx);
                        }
                    }

                    SwarmEvent::IncomingConnectionError { send_back_addr, error, .. } => {
                        tracing::debug!("Incoming connection from {} failed: {}", send_back_addr, error);
                    }

                    SwarmEvent::Behaviour(RelayBehaviourEvent::Relay(event)) => {
                        mirror_relay_event(&table, event);
                        publish_advertised(&table, &addr_tx.borrow(), &advertised_tx);
                    }

                    _ => {}
                },
            }
        }
    });

    Ok(RelayHandle {
        peer_id: local_peer_id,
        table,
        addresses: addr_rx,
        advertised: advertised_rx,
        cancel,
        task,
    })
}

/// Push the table's advertised circuit addresses when they changed
fn publish_advertised(
    table: &RwLock<ReservationTable>,
    relay_addrs: &[Multiaddr],
    advertised: &watch::Sender<Vec<Multiaddr>>,
) {
    let mut current = table.read().advertised_addresses(relay_addrs);
    current.sort();
    advertised.send_if_modified(|published| {
        if *published == current {
            return false;
        }
        for address in current.iter().filter(|a| !published.contains(a)) {
            tracing::info!("Advertising {}", address);
        }
        *published = current;
        true
    });
}

fn mirror_relay_event(table: &RwLock<ReservationTable>, event: relay::Event) {
    match event {
        relay::Event::ReservationReqAccepted { src_peer_id, renewed } => {
            match table.write().reserve(src_peer_id, Instant::now()) {
                Ok(_) if renewed => tracing::debug!("Reservation renewed for {}", src_peer_id),
                Ok(_) => tracing::info!("Reservation accepted for {}", src_peer_id),
                Err(e) => tracing::warn!("Reservation table out of sync: {}", e),
            }
        }
        relay::Event::ReservationReqDenied { src_peer_id } => {
            table.write().record_refusal();
            tracing::warn!("Reservation denied for {}", src_peer_id);
        }
        relay::Event::ReservationTimedOut { src_peer_id } => {
            table.write().release(&src_peer_id);
            tracing::info!("Reservation for {} timed out", src_peer_id);
        }
        relay::Event::CircuitReqAccepted {
            src_peer_id,
            dst_peer_id,
        } => match table.write().open_circuit(src_peer_id, dst_peer_id) {
            Ok(()) => tracing::info!("Circuit {} -> {} opened", src_peer_id, dst_peer_id),
            Err(e) => tracing::warn!("Circuit table out of sync: {}", e),
        },
        relay::Event::CircuitReqDenied {
            src_peer_id,
            dst_peer_id,
        } => {
            tracing::warn!("Circuit {} -> {} denied", src_peer_id, dst_peer_id);
        }
        relay::Event::CircuitClosed {
            src_peer_id,
            dst_peer_id,
            error,
        } => {
            table.write().close_circuit(&src_peer_id, &dst_peer_id);
            match error {
                Some(e) => tracing::info!("Circuit {} -> {} closed: {}", src_peer_id, dst_peer_id, e),
                None => tracing::info!("Circuit {} -> {} closed", src_peer_id, dst_peer_id),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_unbounded() {
        let config = RelayConfig::default();
        assert_eq!(config.to_libp2p().max_reservations, usize::MAX);
        assert_eq!(config.table_limits().max_reservations, None);
        assert!(!config.advertise);
    }

    #[test]
    fn test_finite_cap_carries_through() {
        let config = RelayConfig {
            max_reservations: Some(2),
            ..RelayConfig::default()
        };
        assert_eq!(config.to_libp2p().max_reservations, 2);
        assert_eq!(config.table_limits().max_reservations, Some(2));
    }

    #[test]
    fn test_mirror_tracks_reservation_lifecycle() {
        let table = RwLock::new(ReservationTable::new(TableLimits::default(), false));
        let a = PeerId::random();
        let b = PeerId::random();

        mirror_relay_event(&table, relay::Event::ReservationReqAccepted { src_peer_id: b, renewed: false });
        mirror_relay_event(&table, relay::Event::CircuitReqAccepted { src_peer_id: a, dst_peer_id: b });
        assert_eq!(table.read().stats().circuits_active, 1);

        mirror_relay_event(
            &table,
            relay::Event::CircuitClosed { src_peer_id: a, dst_peer_id: b, error: None },
        );
        mirror_relay_event(&table, relay::Event::ReservationTimedOut { src_peer_id: b });

        let stats = table.read().stats();
        assert_eq!(stats.circuits_active, 0);
        assert_eq!(stats.reservations_active, 0);
        assert_eq!(stats.reservations_accepted, 1);
    }

    #[test]
    fn test_denied_reservation_is_counted() {
        let table = RwLock::new(ReservationTable::new(TableLimits::default(), false));
        mirror_relay_event(&table, relay::Event::ReservationReqDenied { src_peer_id: PeerId::random() });
        let stats = table.read().stats();
        assert_eq!(stats.reservations_refused, 1);
        assert_eq!(stats.reservations_active, 0);
    }

    #[test]
    fn test_advertised_addresses_follow_reservations() {
        let relay_addr: Multiaddr = format!("/ip4/13.60.15.36/tcp/3001/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        let peer = PeerId::random();
        let table = RwLock::new(ReservationTable::new(TableLimits::default(), true));
        let (tx, mut rx) = watch::channel(Vec::new());

        mirror_relay_event(&table, relay::Event::ReservationReqAccepted { src_peer_id: peer, renewed: false });
        publish_advertised(&table, &[relay_addr.clone()], &tx);
        assert!(rx.has_changed().unwrap());
        let expected: Multiaddr = format!("{relay_addr}/p2p-circuit/p2p/{peer}").parse().unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![expected]);

        // Renewal changes nothing
        mirror_relay_event(&table, relay::Event::ReservationReqAccepted { src_peer_id: peer, renewed: true });
        publish_advertised(&table, &[relay_addr.clone()], &tx);
        assert!(!rx.has_changed().unwrap());

        mirror_relay_event(&table, relay::Event::ReservationTimedOut { src_peer_id: peer });
        publish_advertised(&table, &[relay_addr], &tx);
        assert!(rx.borrow_and_update().is_empty());
    }

    #[test]
    fn test_nothing_advertised_when_disabled() {
        let relay_addr: Multiaddr = format!("/ip4/13.60.15.36/tcp/3001/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        let table = RwLock::new(ReservationTable::new(TableLimits::default(), false));
        let (tx, rx) = watch::channel(Vec::new());

        mirror_relay_event(&table, relay::Event::ReservationReqAccepted { src_peer_id: PeerId::random(), renewed: false });
        publish_advertised(&table, &[relay_addr], &tx);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_relay_reports_loopback_address() {
        let keys = NodeKeys::generate();
        let config = RelayConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            ..RelayConfig::default()
        };
        let relay = start_relay(&keys, &config).await.unwrap();
        let addrs = tokio::time::timeout(Duration::from_secs(10), relay.wait_for_addresses())
            .await
            .unwrap()
            .unwrap();
        assert!(addrs.iter().all(|a| a.to_string().ends_with(&format!("/p2p/{}", keys.peer_id()))));
        relay.shutdown().await;
    }
}
