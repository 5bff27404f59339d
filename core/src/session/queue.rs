// Outbound queue — local input waiting to be written to one session's stream
//
// `push` never blocks and never drops an item; `end` stops further pushes but
// everything already queued is still written before the write side closes.

use futures::{AsyncWrite, AsyncWriteExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Outbound queue has ended")]
pub struct QueueEnded;

/// Encode one line of local input for the wire
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Producer side of a session's outbound queue
#[derive(Debug)]
pub struct OutboundQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pushed: AtomicU64,
}

/// Consumer side, owned by the drain task
#[derive(Debug)]
pub struct QueueDrain {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Create a connected queue and drain
pub fn channel() -> (Arc<OutboundQueue>, QueueDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = OutboundQueue {
        tx: Mutex::new(Some(tx)),
        pushed: AtomicU64::new(0),
    };
    (Arc::new(queue), QueueDrain { rx })
}

impl OutboundQueue {
    /// Append an item. Fails only after [`OutboundQueue::end`].
    pub fn push(&self, item: Vec<u8>) -> Result<(), QueueEnded> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(QueueEnded)?;
        tx.send(item).map_err(|_| QueueEnded)?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Graceful close. Returns `true` for the call that actually ended the queue.
    pub fn end(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Items accepted so far
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl QueueDrain {
    /// Next queued item; `None` once the queue ended and is empty
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Write every item in order, then close the writer.
    ///
    /// Returns the number of bytes written. Cancellation stops writing
    /// immediately without draining the remainder.
    pub async fn drain_into<W>(
        mut self,
        writer: &mut W,
        cancel: CancellationToken,
    ) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.rx.recv() => item,
            };
            let Some(item) = item else { break };
            writer.write_all(&item).await?;
            writer.flush().await?;
            written += item.len() as u64;
        }
        writer.close().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_line() {
        assert_eq!(encode_line("hi"), b"hi\n".to_vec());
        assert_eq!(encode_line(""), b"\n".to_vec());
    }

    #[test]
    fn test_push_after_end_fails() {
        let (queue, _drain) = channel();
        queue.push(b"a".to_vec()).unwrap();
        assert!(queue.end());
        assert!(!queue.end());
        assert!(queue.is_ended());
        assert_eq!(queue.push(b"b".to_vec()), Err(QueueEnded));
        assert_eq!(queue.pushed(), 1);
    }

    #[tokio::test]
    async fn test_drain_before_close() {
        let (queue, drain) = channel();
        for i in 0..50 {
            queue.push(encode_line(&format!("line {i}"))).unwrap();
        }
        queue.end();

        let mut sink = futures::io::Cursor::new(Vec::new());
        let written = drain
            .drain_into(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[49], "line 49");
        assert_eq!(written, text.len() as u64);
    }

    #[tokio::test]
    async fn test_cancel_stops_drain() {
        let (queue, drain) = channel();
        queue.push(b"never ended\n".to_vec()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut sink = futures::io::Cursor::new(Vec::new());
        drain.drain_into(&mut sink, cancel).await.unwrap();
        assert!(!queue.is_ended());
    }
}
