// Session protocol handler — accept and dial of the application stream
//
// Inbound: one accept loop registered at startup hands each stream to a
// fresh DuplexPump without waiting for it.
// Outbound: gate check, address-book patch, outbound limit, open the stream,
// then the same pump. A failed dial leaves no session behind.

use super::input::InputBus;
use super::pump::DuplexPump;
use super::{
    Direction, OutputSink, SessionError, SessionId, SessionInfo, SessionOutput, SessionRegistry,
    SessionState,
};
use crate::config::{DialOptions, InboundLimits, NodeConfig};
use crate::transport::address::DialTarget;
use crate::transport::gate::AddressGate;
use crate::transport::swarm::SwarmHandle;
use crate::transport::view::NetworkView;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, Stream, StreamExt};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use crate::config::DEFAULT_PROTOCOL;

/// The transport capabilities a session needs.
///
/// Implemented over the running swarm by [`Libp2pDialer`]; mocked in tests.
#[cfg_attr(test, mockall::automock(type Stream = super::testing::ScriptedStream;))]
#[async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Record `address` for `peer` so a dial by peer id can resolve it
    async fn patch_address(&self, peer: PeerId, address: Multiaddr) -> anyhow::Result<()>;

    /// Open and fully negotiate a stream of `protocol` to `peer`
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, String>;

    /// Whether every connection to `peer` is relayed
    fn is_limited(&self, peer: &PeerId) -> bool;
}

pub struct SessionProtocol<D: StreamDialer> {
    dialer: Arc<D>,
    local: PeerId,
    protocol: StreamProtocol,
    gate: AddressGate,
    inbound: InboundLimits,
    dial: DialOptions,
    inbound_permits: Arc<Semaphore>,
    registry: SessionRegistry,
    bus: InputBus,
    output: OutputSink,
    cancel: CancellationToken,
}

impl<D: StreamDialer> Clone for SessionProtocol<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            local: self.local,
            protocol: self.protocol.clone(),
            gate: self.gate.clone(),
            inbound: self.inbound.clone(),
            dial: self.dial.clone(),
            inbound_permits: self.inbound_permits.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            output: self.output.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D: StreamDialer> SessionProtocol<D> {
    pub fn new(
        dialer: D,
        local: PeerId,
        gate: AddressGate,
        config: &NodeConfig,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let protocol = StreamProtocol::try_from_owned(config.protocol.clone())
            .map_err(|_| SessionError::InvalidProtocol(config.protocol.clone()))?;

        Ok(Self {
            dialer: Arc::new(dialer),
            local,
            protocol,
            gate,
            inbound: config.inbound.clone(),
            dial: config.dial.clone(),
            inbound_permits: Arc::new(Semaphore::new(config.inbound.max_inbound_streams)),
            registry: SessionRegistry::new(),
            bus: InputBus::new(),
            output,
            cancel,
        })
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    pub fn bus(&self) -> &InputBus {
        &self.bus
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run the accept loop over `incoming` until it ends or the node shuts down
    pub fn serve_inbound<I>(&self, incoming: I) -> JoinHandle<()>
    where
        I: Stream<Item = (PeerId, D::Stream)> + Send + Unpin + 'static,
    {
        let this = self.clone();
        let mut incoming = incoming;
        tracing::info!("Accepting {} streams", this.protocol);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    next = incoming.next() => next,
                };
                let Some((peer, stream)) = next else { break };
                if let Err(e) = this.accept(peer, stream) {
                    tracing::warn!("Dropped inbound stream from {}: {}", peer, e);
                }
            }
            tracing::debug!("Accept loop for {} stopped", this.protocol);
        })
    }

    /// Turn one inbound stream into a session. Dropping a refused stream resets it.
    pub fn accept(&self, peer: PeerId, stream: D::Stream) -> Result<SessionId, SessionError> {
        if !self.inbound.run_on_limited_connection && self.dialer.is_limited(&peer) {
            return Err(SessionError::Refused {
                reason: "peer is only reachable over a limited connection".to_string(),
            });
        }

        let permit = self
            .inbound_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| SessionError::Refused {
                reason: format!(
                    "inbound limit of {} streams reached",
                    self.inbound.max_inbound_streams
                ),
            })?;

        let info = SessionInfo::new(self.local, peer, self.protocol.to_string(), Direction::Inbound);
        self.registry.insert(info.clone(), SessionState::Negotiating);
        Ok(self.spawn_session(info, stream, Some(permit)))
    }

    /// Parse interactive address text and dial it
    pub async fn dial_text(&self, text: &str) -> Result<SessionId, SessionError> {
        let target = DialTarget::parse(text)?;
        self.dial(target).await
    }

    pub async fn dial(&self, target: DialTarget) -> Result<SessionId, SessionError> {
        self.gate.check(&target.address)?;

        if !self.dial.run_on_limited_connection && target.is_circuit() {
            return Err(SessionError::dial(
                "target is only reachable over a limited connection",
            ));
        }

        self.dialer
            .patch_address(target.peer_id, target.address.clone())
            .await
            .map_err(|e| SessionError::dial(format!("address book: {}", e)))?;

        if !self.dial.negotiate_fully {
            tracing::debug!("Lazy negotiation not supported, negotiating fully");
        }

        let info = SessionInfo::new(
            self.local,
            target.peer_id,
            self.protocol.to_string(),
            Direction::Outbound,
        );
        let admitted = self.registry.insert_if_below(
            info.clone(),
            SessionState::Negotiating,
            self.dial.max_outbound_streams,
        );
        if !admitted {
            return Err(SessionError::dial(format!(
                "outbound limit of {} streams to {} reached",
                self.dial.max_outbound_streams, target.peer_id
            )));
        }
        tracing::info!("Dialing {} via {}", target.peer_id, target.address);

        let opened = tokio::time::timeout(
            self.dial.dial_timeout(),
            self.dialer.open_stream(target.peer_id, self.protocol.clone()),
        )
        .await;

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(reason)) => {
                self.registry.remove(&info.id);
                tracing::warn!("Dial to {} failed: {}", target.peer_id, reason);
                return Err(SessionError::dial(reason));
            }
            Err(_) => {
                self.registry.remove(&info.id);
                tracing::warn!("Dial to {} timed out", target.peer_id);
                return Err(SessionError::dial(format!(
                    "timed out after {:?} opening stream",
                    self.dial.dial_timeout()
                )));
            }
        };

        Ok(self.spawn_session(info, stream, None))
    }

    fn spawn_session(
        &self,
        info: SessionInfo,
        stream: D::Stream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> SessionId {
        let id = info.id;
        self.registry.set_state(&id, SessionState::Open);
        tracing::info!(
            "Session {} open: {} {} on {}",
            id,
            info.direction,
            info.remote,
            info.protocol
        );
        let _ = self.output.send(SessionOutput::Opened(info.clone()));

        let pump = DuplexPump::new(
            info.clone(),
            stream,
            &self.bus,
            self.output.clone(),
            self.registry.clone(),
            self.cancel.child_token(),
        );
        let registry = self.registry.clone();
        let output = self.output.clone();

        tokio::spawn(async move {
            let report = pump.run().await;
            drop(permit);
            registry.remove(&info.id);
            tracing::debug!(
                "Session {} closed ({}): {} bytes in, {} bytes out",
                info.id,
                report.termination,
                report.bytes_in,
                report.bytes_out
            );
            let _ = output.send(SessionOutput::Closed {
                info,
                termination: report.termination,
            });
        });

        id
    }
}

/// [`StreamDialer`] over the running swarm
pub struct Libp2pDialer {
    control: libp2p_stream::Control,
    swarm: SwarmHandle,
    view: NetworkView,
}

impl Libp2pDialer {
    pub fn new(control: libp2p_stream::Control, swarm: SwarmHandle, view: NetworkView) -> Self {
        Self {
            control,
            swarm,
            view,
        }
    }
}

#[async_trait]
impl StreamDialer for Libp2pDialer {
    type Stream = libp2p::Stream;

    async fn patch_address(&self, peer: PeerId, address: Multiaddr) -> anyhow::Result<()> {
        self.swarm.patch_addresses(peer, vec![address]).await
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, String> {
        let mut control = self.control.clone();
        control
            .open_stream(peer, protocol)
            .await
            .map_err(|e| e.to_string())
    }

    fn is_limited(&self, peer: &PeerId) -> bool {
        self.view.is_limited(peer)
    }
}
