// Duplex pump — couples one session stream to local input and output
//
// Outbound: InputBus -> OutboundQueue -> drain task -> stream write half.
// Inbound: stream read half -> read loop -> output sink.
// When the read side terminates the queue is ended (its backlog still drains)
// and the input subscription is released exactly once.

use super::input::{InputBus, SubscriptionHandle, SubscriptionId};
use super::queue::{self, OutboundQueue, QueueDrain};
use super::{OutputSink, SessionInfo, SessionOutput, SessionRegistry, SessionState};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 4096;

/// How the inbound side of a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Remote finished its write side
    End,
    /// Stream reset by the remote or the connection went away
    Reset,
    /// Any other read failure
    Error(String),
    /// Local shutdown
    Cancelled,
}

impl Termination {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Termination::Reset,
            _ => Termination::Error(err.to_string()),
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::End => f.write_str("end"),
            Termination::Reset => f.write_str("reset"),
            Termination::Error(e) => write!(f, "error: {}", e),
            Termination::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub termination: Termination,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Splits incoming bytes into text without breaking multi-byte characters
/// that straddle two reads.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of an incomplete sequence at the end of `bytes`. Invalid bytes
/// earlier in the buffer are skipped over.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return 0,
            Err(e) => match e.error_len() {
                None => return bytes.len() - start - e.valid_up_to(),
                Some(invalid) => start += e.valid_up_to() + invalid,
            },
        }
    }
}

/// Drives a single session until its stream terminates
pub struct DuplexPump<S> {
    info: SessionInfo,
    stream: S,
    queue: Arc<OutboundQueue>,
    drain: QueueDrain,
    subscription: SubscriptionHandle,
    output: OutputSink,
    registry: SessionRegistry,
    cancel: CancellationToken,
}

impl<S> DuplexPump<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Create the session's queue and subscribe it to `bus`
    pub fn new(
        info: SessionInfo,
        stream: S,
        bus: &InputBus,
        output: OutputSink,
        registry: SessionRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, drain) = queue::channel();
        let subscription = bus.subscribe(queue.clone());
        Self {
            info,
            stream,
            queue,
            drain,
            subscription,
            output,
            registry,
            cancel,
        }
    }

    pub fn queue(&self) -> Arc<OutboundQueue> {
        self.queue.clone()
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub async fn run(self) -> PumpReport {
        let Self {
            info,
            stream,
            queue,
            drain,
            subscription,
            output,
            registry,
            cancel,
        } = self;

        let (mut reader, mut writer) = stream.split();

        let writer_cancel = cancel.clone();
        let writer_task =
            tokio::spawn(async move { drain.drain_into(&mut writer, writer_cancel).await });

        let mut buf = vec![0u8; READ_CHUNK];
        let mut chunker = Utf8Chunker::default();
        let mut bytes_in = 0u64;

        let termination = loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break Termination::Cancelled,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break Termination::End,
                Ok(n) => {
                    bytes_in += n as u64;
                    let text = chunker.push(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    tracing::debug!("{} <- {}: {} bytes", info.id, info.remote, n);
                    let _ = output.send(SessionOutput::Received {
                        session: info.id,
                        peer: info.remote,
                        direction: info.direction,
                        text,
                    });
                }
                Err(e) => break Termination::from_io(&e),
            }
        };

        if let Some(text) = chunker.finish() {
            let _ = output.send(SessionOutput::Received {
                session: info.id,
                peer: info.remote,
                direction: info.direction,
                text,
            });
        }

        match &termination {
            Termination::End => {
                tracing::info!("Session {} with {} ended by remote", info.id, info.remote)
            }
            Termination::Reset => {
                tracing::warn!("Session {} with {} was reset", info.id, info.remote)
            }
            Termination::Error(e) => {
                tracing::warn!("Session {} with {} failed: {}", info.id, info.remote, e)
            }
            Termination::Cancelled => {
                tracing::info!("Session {} with {} cancelled", info.id, info.remote)
            }
        }

        if termination == Termination::Reset {
            registry.set_state(&info.id, SessionState::Reset);
        } else {
            registry.set_state(&info.id, SessionState::Closing);
        }

        queue.end();
        subscription.release();

        let bytes_out = match writer_task.await {
            Ok(Ok(written)) => written,
            Ok(Err(e)) => {
                tracing::debug!("Session {} write side stopped: {}", info.id, e);
                0
            }
            Err(e) => {
                tracing::error!("Session {} drain task panicked: {}", info.id, e);
                0
            }
        };

        if termination != Termination::Reset {
            registry.set_state(&info.id, SessionState::Closed);
        }

        PumpReport {
            termination,
            bytes_in,
            bytes_out,
        }
    }
}
