//! Application sessions over the relay
//!
//! A session is one negotiated duplex stream of the chat protocol between
//! this node and one remote peer. Sessions are created by
//! [`SessionProtocol`] (accept or dial), driven by a [`DuplexPump`] and
//! tracked in a [`SessionRegistry`] until their stream ends.
//!
//! State machine: `Negotiating -> Open -> {Closing -> Closed | Reset}`.

pub mod console;
pub mod input;
pub mod protocol;
pub mod pump;
pub mod queue;

pub use console::ConsoleCommand;
pub use input::{InputBus, SubscriptionHandle, SubscriptionId};
pub use protocol::{Libp2pDialer, SessionProtocol, StreamDialer, DEFAULT_PROTOCOL};
pub use pump::{DuplexPump, PumpReport, Termination};
pub use queue::{OutboundQueue, QueueDrain, QueueEnded};

use crate::transport::{AddressError, GateError};
use libp2p::PeerId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Session-level failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Gate rejected dial: {0}")]
    GateRejected(#[from] GateError),
    #[error("Dial failed: {reason}")]
    DialFailure { reason: String },
    #[error("Address parse error: {0}")]
    AddressParse(#[from] AddressError),
    #[error("Inbound stream refused: {reason}")]
    Refused { reason: String },
    #[error("Invalid protocol name {0:?}")]
    InvalidProtocol(String),
}

impl SessionError {
    pub(crate) fn dial(reason: impl Into<String>) -> Self {
        Self::DialFailure {
            reason: reason.into(),
        }
    }
}

/// Unique identifier of a session within this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self.0.simple().to_string();
        f.write_str(&text[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Negotiating,
    Open,
    Closing,
    Closed,
    Reset,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Reset)
    }
}

/// Identity of a session: (local, remote, protocol, direction)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub local: PeerId,
    pub remote: PeerId,
    pub protocol: String,
    pub direction: Direction,
}

impl SessionInfo {
    pub fn new(local: PeerId, remote: PeerId, protocol: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: SessionId::new(),
            local,
            remote,
            protocol: protocol.into(),
            direction,
        }
    }
}

/// What sessions report to the local front end
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// A stream finished negotiation
    Opened(SessionInfo),
    /// A chunk arrived from the remote peer
    Received {
        session: SessionId,
        peer: PeerId,
        direction: Direction,
        text: String,
    },
    /// The stream is gone and the session torn down
    Closed {
        info: SessionInfo,
        termination: Termination,
    },
}

/// Where session output goes
pub type OutputSink = mpsc::UnboundedSender<SessionOutput>;

#[derive(Debug, Clone)]
struct SessionEntry {
    info: SessionInfo,
    state: SessionState,
}

/// Open sessions of this node
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: SessionInfo, state: SessionState) {
        self.inner
            .write()
            .insert(info.id, SessionEntry { info, state });
    }

    /// Track a session that just finished negotiation
    pub fn insert_open(&self, info: SessionInfo) {
        self.insert(info, SessionState::Open);
    }

    pub fn set_state(&self, id: &SessionId, state: SessionState) {
        if let Some(entry) = self.inner.write().get_mut(id) {
            tracing::debug!("Session {} {:?} -> {:?}", id, entry.state, state);
            entry.state = state;
        }
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.inner.read().get(id).map(|e| e.state)
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        self.inner.write().remove(id).map(|e| e.info)
    }

    /// Snapshot of every tracked session
    pub fn list(&self) -> Vec<(SessionInfo, SessionState)> {
        self.inner
            .read()
            .values()
            .map(|e| (e.info.clone(), e.state))
            .collect()
    }

    /// Non-terminal sessions with `peer` in `direction`
    pub fn count_active(&self, peer: &PeerId, direction: Direction) -> usize {
        active_in(&self.inner.read(), peer, direction)
    }

    /// Track `info` only while fewer than `limit` sessions with the same
    /// peer and direction are active. Count and insert share one lock.
    pub fn insert_if_below(&self, info: SessionInfo, state: SessionState, limit: usize) -> bool {
        let mut sessions = self.inner.write();
        if active_in(&sessions, &info.remote, info.direction) >= limit {
            return false;
        }
        sessions.insert(info.id, SessionEntry { info, state });
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn active_in(sessions: &HashMap<SessionId, SessionEntry>, peer: &PeerId, direction: Direction) -> usize {
    sessions
        .values()
        .filter(|e| e.info.remote == *peer && e.info.direction == direction)
        .filter(|e| !e.state.is_terminal())
        .count()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stream whose inbound side is scripted by the test

    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::{AsyncRead, AsyncWrite, StreamExt};
    use parking_lot::Mutex;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[derive(Default)]
    struct Shared {
        written: Mutex<Vec<u8>>,
        closed: AtomicBool,
        broken: AtomicBool,
    }

    pub struct ScriptedStream {
        incoming: UnboundedReceiver<io::Result<Vec<u8>>>,
        leftover: Vec<u8>,
        shared: Arc<Shared>,
    }

    /// Test-side controller of a [`ScriptedStream`]
    #[derive(Clone)]
    pub struct StreamScript {
        tx: UnboundedSender<io::Result<Vec<u8>>>,
        shared: Arc<Shared>,
    }

    pub(crate) fn scripted() -> (ScriptedStream, StreamScript) {
        let (tx, incoming) = unbounded();
        let shared = Arc::new(Shared::default());
        (
            ScriptedStream {
                incoming,
                leftover: Vec::new(),
                shared: shared.clone(),
            },
            StreamScript { tx, shared },
        )
    }

    impl StreamScript {
        /// Deliver bytes as if the remote wrote them
        pub(crate) fn send(&self, bytes: &[u8]) {
            let _ = self.tx.unbounded_send(Ok(bytes.to_vec()));
        }

        /// Remote closed its write side
        pub(crate) fn finish(&self) {
            self.tx.close_channel();
        }

        /// Remote or network reset the stream
        pub(crate) fn reset(&self) {
            self.shared.broken.store(true, Ordering::SeqCst);
            let _ = self.tx.unbounded_send(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.shared.written.lock().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.shared.closed.load(Ordering::SeqCst)
        }
    }

    impl AsyncRead for ScriptedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            while self.leftover.is_empty() {
                match self.incoming.poll_next_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => return Poll::Ready(Ok(0)),
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                    Poll::Ready(Some(Ok(bytes))) => self.leftover = bytes,
                }
            }
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for ScriptedStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.shared.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            self.shared.written.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shared.closed.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_counts_active_by_direction() {
        let registry = SessionRegistry::new();
        let local = PeerId::random();
        let remote = PeerId::random();

        let out = SessionInfo::new(local, remote, "/node-1", Direction::Outbound);
        let inb = SessionInfo::new(local, remote, "/node-1", Direction::Inbound);
        registry.insert_open(out.clone());
        registry.insert_open(inb);

        assert_eq!(registry.count_active(&remote, Direction::Outbound), 1);
        assert_eq!(registry.count_active(&remote, Direction::Inbound), 1);

        registry.set_state(&out.id, SessionState::Reset);
        assert_eq!(registry.count_active(&remote, Direction::Outbound), 0);
        assert_eq!(registry.state(&out.id), Some(SessionState::Reset));

        assert_eq!(registry.remove(&out.id), Some(out));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_if_below_holds_under_contention() {
        let registry = SessionRegistry::new();
        let local = PeerId::random();
        let remote = PeerId::random();

        let inserted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || {
                        let info = SessionInfo::new(local, remote, "/node-1", Direction::Outbound);
                        registry.insert_if_below(info, SessionState::Negotiating, 3)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(inserted, 3);
        assert_eq!(registry.count_active(&remote, Direction::Outbound), 3);

        // Terminal sessions free their slot
        let (first, _) = registry.list().remove(0);
        registry.set_state(&first.id, SessionState::Closed);
        let info = SessionInfo::new(local, remote, "/node-1", Direction::Outbound);
        assert!(registry.insert_if_below(info, SessionState::Negotiating, 3));
    }

    #[test]
    fn test_session_id_display_is_short() {
        assert_eq!(SessionId::new().to_string().len(), 8);
    }
}
