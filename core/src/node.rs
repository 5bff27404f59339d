// Peer node — identity, swarm, reservations and sessions wired together

use crate::config::NodeConfig;
use crate::identity::NodeKeys;
use crate::relay::client::ReservationManager;
use crate::session::{
    InputBus, Libp2pDialer, SessionError, SessionId, SessionInfo, SessionOutput, SessionProtocol,
    SessionState,
};
use crate::transport::swarm::{start_peer_swarm, NetworkEvent, PeerSwarm};
use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A NATed peer reachable only through its relays
pub struct PeerNode {
    peer_id: PeerId,
    relays: Vec<Multiaddr>,
    swarm: PeerSwarm,
    protocol: SessionProtocol<Libp2pDialer>,
    reservations: ReservationManager,
    output_rx: Option<mpsc::UnboundedReceiver<SessionOutput>>,
    accept_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl PeerNode {
    /// Start the swarm. No reservation is requested yet.
    pub async fn start(keys: NodeKeys, config: NodeConfig) -> Result<Self> {
        let peer_id = keys.peer_id();
        let relays = config.relay_addrs()?;
        let gate = config.gate()?;
        let cancel = CancellationToken::new();

        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(log_network_events(event_rx));

        let swarm = start_peer_swarm(&keys, &config, gate.clone(), event_tx)
            .await
            .context("Failed to start peer swarm")?;

        let dialer = Libp2pDialer::new(
            swarm.control.clone(),
            swarm.handle.clone(),
            swarm.view.clone(),
        );
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let protocol = SessionProtocol::new(
            dialer,
            peer_id,
            gate,
            &config,
            output_tx,
            cancel.child_token(),
        )?;

        Ok(Self {
            peer_id,
            relays,
            swarm,
            protocol,
            reservations: ReservationManager::new(peer_id, &config.reservation),
            output_rx: Some(output_rx),
            accept_task: None,
            cancel,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Obtain a reservation on every configured relay and return the circuit addresses
    pub async fn reserve(&self) -> Result<Vec<Multiaddr>> {
        if self.relays.is_empty() {
            anyhow::bail!("No relay configured");
        }
        let mut circuits = Vec::with_capacity(self.relays.len());
        for relay in &self.relays {
            let address = self
                .reservations
                .request_reservation(&self.swarm.handle, &self.swarm.view, relay)
                .await?;
            circuits.push(address);
        }
        Ok(circuits)
    }

    /// Register the application protocol and start accepting streams
    pub fn accept_inbound(&mut self) -> Result<()> {
        if self.accept_task.is_some() {
            return Ok(());
        }
        let mut control = self.swarm.control.clone();
        let incoming = control
            .accept(self.protocol.protocol().clone())
            .map_err(|e| anyhow::anyhow!("Cannot accept {}: {}", self.protocol.protocol(), e))?;
        self.accept_task = Some(self.protocol.serve_inbound(incoming.boxed()));
        Ok(())
    }

    pub async fn dial_text(&self, text: &str) -> Result<SessionId, SessionError> {
        self.protocol.dial_text(text).await
    }

    /// Local line source shared by all sessions
    pub fn input(&self) -> InputBus {
        self.protocol.bus().clone()
    }

    /// Session output; can be taken once
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<SessionOutput>> {
        self.output_rx.take()
    }

    pub fn sessions(&self) -> Vec<(SessionInfo, SessionState)> {
        self.protocol.registry().list()
    }

    /// Every address this node currently listens on
    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.swarm.view.listen_addresses()
    }

    /// Only the relay circuit addresses other peers can dial
    pub fn circuit_addresses(&self) -> Vec<Multiaddr> {
        self.addresses()
            .into_iter()
            .filter(crate::transport::is_circuit)
            .collect()
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.swarm.handle.get_peers().await
    }

    /// Cancel every session and stop the swarm
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }
        if let Err(e) = self.swarm.handle.shutdown().await {
            tracing::debug!("Swarm already stopped: {}", e);
        }
        tracing::info!("Node {} stopped", self.peer_id);
    }
}

async fn log_network_events(mut events: mpsc::Receiver<NetworkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::DialError { peer_id, error } => {
                tracing::debug!("Dial error for {:?}: {}", peer_id, error)
            }
            other => tracing::trace!("Network event: {:?}", other),
        }
    }
}
