// libp2p swarm setup — the running peer node
//
// This creates and manages the libp2p Swarm with:
// - TCP + WebSocket transports (DNS resolution for relay host names)
// - Noise encryption
// - Yamux multiplexing
// - Relay client transport for circuit addresses
// - All behaviours from behaviour.rs

use super::address::{relay_peer_id, with_peer};
use super::behaviour::{PeerBehaviour, PeerBehaviourEvent};
use super::gate::AddressGate;
use super::view::NetworkView;
use crate::config::NodeConfig;
use crate::identity::NodeKeys;
use anyhow::Result;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::{identify, noise, ping, relay, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial an address (the gate still applies)
    Dial {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Start listening on an address, including `<relay>/p2p-circuit`
    Listen {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Record dialable addresses for a peer
    PatchAddresses {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: mpsc::Sender<()>,
    },
    /// Get list of connected peers
    GetPeers { reply: mpsc::Sender<Vec<PeerId>> },
    /// Shutdown the swarm
    Shutdown,
}

/// Events emitted by the swarm to the application layer
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ListeningOn(Multiaddr),
    ListenAddrExpired(Multiaddr),
    PeerConnected { peer_id: PeerId, address: Multiaddr },
    PeerDisconnected(PeerId),
    /// The relay accepted (or renewed) our reservation
    ReservationAccepted { relay: PeerId, renewal: bool },
    /// A remote peer reached us through a relay
    InboundCircuit { src: PeerId },
    OutboundCircuit { relay: PeerId },
    DialError { peer_id: Option<PeerId>, error: String },
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    /// Dial a multiaddress
    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(SwarmCommand::Dial {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Start listening on an address
    pub async fn listen(&self, addr: Multiaddr) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(SwarmCommand::Listen {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Associate a peer with addresses so dials by peer id resolve
    pub async fn patch_addresses(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(SwarmCommand::PatchAddresses {
                peer_id,
                addrs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))
    }

    /// Get connected peers
    pub async fn get_peers(&self) -> Result<Vec<PeerId>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(SwarmCommand::GetPeers { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }
}

/// A started peer swarm
pub struct PeerSwarm {
    pub handle: SwarmHandle,
    /// Opens and accepts application streams
    pub control: libp2p_stream::Control,
    pub view: NetworkView,
}

/// Build and start the peer swarm, returning a handle for communication.
///
/// This spawns a tokio task that runs the swarm event loop.
pub async fn start_peer_swarm(
    keys: &NodeKeys,
    config: &NodeConfig,
    gate: AddressGate,
    event_tx: mpsc::Sender<NetworkEvent>,
) -> Result<PeerSwarm> {
    let local_peer_id = keys.peer_id();

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
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| {
            PeerBehaviour::new(key, relay_client, gate, config.connections.to_libp2p())
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(config.idle_connection_timeout()))
        .build();

    for addr in config.listen_multiaddrs()? {
        swarm.listen_on(addr)?;
    }

    let control = swarm.behaviour().streams.new_control();
    let view = NetworkView::new();
    let task_view = view.clone();

    let (command_tx, mut command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle { command_tx };

    tracing::info!("Peer swarm started as {}", local_peer_id);

    // Spawn the swarm event loop
    tokio::spawn(async move {
        let view = task_view;
        // Circuit listeners and the relay each one reserves on
        let mut circuit_listeners: HashMap<ListenerId, PeerId> = HashMap::new();
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            let address = with_peer(address, local_peer_id);
                            tracing::info!("Listening on {}", address);
                            view.add_listen_addr(address.clone());
                            let _ = event_tx.send(NetworkEvent::ListeningOn(address)).await;
                        }

                        SwarmEvent::ExpiredListenAddr { address, .. } => {
                            let address = with_peer(address, local_peer_id);
                            tracing::info!("No longer listening on {}", address);
                            view.remove_listen_addr(&address);
                            let _ = event_tx.send(NetworkEvent::ListenAddrExpired(address)).await;
                        }

                        SwarmEvent::ListenerClosed { listener_id, addresses, reason, .. } => {
                            let reason = match reason {
                                Ok(()) => "circuit listener closed".to_string(),
                                Err(e) => {
                                    tracing::warn!("Listener closed: {}", e);
                                    e.to_string()
                                }
                            };
                            if let Some(relay) = circuit_listeners.remove(&listener_id) {
                                view.relay_failed(relay, reason);
                            }
                            for address in addresses {
                                view.remove_listen_addr(&with_peer(address, local_peer_id));
                            }
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                            let address = endpoint.get_remote_address().clone();
                            tracing::info!("Connected to {} via {}", peer_id, address);
                            view.connection_opened(peer_id, connection_id, &endpoint);
                            let _ = event_tx.send(NetworkEvent::PeerConnected { peer_id, address }).await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, connection_id, num_established, cause, .. } => {
                            view.connection_closed(&peer_id, &connection_id);
                            if num_established == 0 {
                                match cause {
                                    Some(e) => tracing::info!("Disconnected from {}: {}", peer_id, e),
                                    None => tracing::info!("Disconnected from {}", peer_id),
                                }
                                let _ = event_tx.send(NetworkEvent::PeerDisconnected(peer_id)).await;
                            }
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            tracing::warn!("Dial to {:?} failed: {}", peer_id, error);
                            if let Some(peer) = peer_id.filter(|p| circuit_listeners.values().any(|r| r == p)) {
                                view.relay_failed(peer, format!("dial failed: {}", error));
                            }
                            let _ = event_tx.send(NetworkEvent::DialError {
                                peer_id,
                                error: error.to_string(),
                            }).await;
                        }

                        SwarmEvent::Behaviour(PeerBehaviourEvent::RelayClient(
                            relay::client::Event::ReservationReqAccepted { relay_peer_id, renewal, .. }
                        )) => {
                            tracing::info!("Reservation accepted by relay {} (renewal: {})", relay_peer_id, renewal);
                            let _ = event_tx.send(NetworkEvent::ReservationAccepted {
                                relay: relay_peer_id,
                                renewal,
                            }).await;
                        }

                        SwarmEvent::Behaviour(PeerBehaviourEvent::RelayClient(
                            relay::client::Event::InboundCircuitEstablished { src_peer_id, .. }
                        )) => {
                            tracing::info!("Inbound circuit from {}", src_peer_id);
                            let _ = event_tx.send(NetworkEvent::InboundCircuit { src: src_peer_id }).await;
                        }

                        SwarmEvent::Behaviour(PeerBehaviourEvent::RelayClient(
                            relay::client::Event::OutboundCircuitEstablished { relay_peer_id, .. }
                        )) => {
                            tracing::debug!("Outbound circuit via {}", relay_peer_id);
                            let _ = event_tx.send(NetworkEvent::OutboundCircuit { relay: relay_peer_id }).await;
                        }

                        SwarmEvent::Behaviour(PeerBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            tracing::debug!(
                                "Identified {} ({}) observing us at {}",
                                peer_id, info.agent_version, info.observed_addr
                            );
                        }

                        SwarmEvent::Behaviour(PeerBehaviourEvent::Ping(ping::Event { peer, result: Err(e), .. })) => {
                            tracing::debug!("Ping to {} failed: {}", peer, e);
                        }

                        _ => {}
                    }
                }

                // Process commands from the application layer
                Some(command) = command_rx.recv() => {
                    match command {
                        SwarmCommand::Dial { addr, reply } => {
                            match swarm.dial(addr) {
                                Ok(_) => { let _ = reply.send(Ok(())).await; }
                                Err(e) => { let _ = reply.send(Err(e.to_string())).await; }
                            }
                        }

                        SwarmCommand::Listen { addr, reply } => {
                            let relay = relay_peer_id(&addr);
                            match swarm.listen_on(addr) {
                                Ok(listener_id) => {
                                    if let Some(relay) = relay {
                                        circuit_listeners.insert(listener_id, relay);
                                    }
                                    let _ = reply.send(Ok(())).await;
                                }
                                Err(e) => { let _ = reply.send(Err(e.to_string())).await; }
                            }
                        }

                        SwarmCommand::PatchAddresses { peer_id, addrs, reply } => {
                            swarm.behaviour_mut().gate.patch(peer_id, addrs);
                            let _ = reply.send(()).await;
                        }

                        SwarmCommand::GetPeers { reply } => {
                            let peers: Vec<PeerId> = swarm.connected_peers().cloned().collect();
                            let _ = reply.send(peers).await;
                        }

                        SwarmCommand::Shutdown => {
                            tracing::info!("Swarm shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(PeerSwarm {
        handle,
        control,
        view,
    })
}
