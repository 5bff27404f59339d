// Input bus — the single local line source shared by every open session
//
// Each session subscribes its own outbound queue and must release the
// subscription exactly once when it tears down.

use super::queue::{encode_line, OutboundQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifier of one subscription on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<SubscriptionId, Arc<OutboundQueue>>,
}

/// Process-wide fan-out of local input lines
#[derive(Clone, Default)]
pub struct InputBus {
    inner: Arc<Mutex<BusInner>>,
}

impl InputBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue to receive every subsequently published line
    pub fn subscribe(&self, queue: Arc<OutboundQueue>) -> SubscriptionHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.insert(id, queue);
        tracing::debug!("Input subscription {} added ({} active)", id, inner.subscribers.len());

        SubscriptionHandle {
            id,
            bus: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!("Input subscription {} removed ({} active)", id, inner.subscribers.len());
        }
        removed
    }

    /// Queue `line` on every subscribed session. Returns how many accepted it.
    pub fn publish(&self, line: &str) -> usize {
        let encoded = encode_line(line);
        let inner = self.inner.lock();
        inner
            .subscribers
            .values()
            .filter(|queue| queue.push(encoded.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// A session's registration on the [`InputBus`].
///
/// Released explicitly during teardown, or on drop as a fallback.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    bus: InputBus,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription. Only the first call has an effect.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.bus.unsubscribe(self.id)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::queue;
    use super::*;

    #[tokio::test]
    async fn test_independent_queues() {
        let bus = InputBus::new();
        let (queue_a, mut drain_a) = queue::channel();
        let (queue_b, mut drain_b) = queue::channel();
        let _sub_a = bus.subscribe(queue_a.clone());
        let _sub_b = bus.subscribe(queue_b.clone());

        assert_eq!(bus.publish("first"), 2);
        queue_a.end();
        assert_eq!(bus.publish("second"), 1);

        assert_eq!(drain_a.next().await, Some(b"first\n".to_vec()));
        assert_eq!(drain_a.next().await, None);
        assert_eq!(drain_b.next().await, Some(b"first\n".to_vec()));
        assert_eq!(drain_b.next().await, Some(b"second\n".to_vec()));
    }

    #[tokio::test]
    async fn test_empty_lines_keep_their_place() {
        let bus = InputBus::new();
        let (queue, mut drain) = queue::channel();
        let _sub = bus.subscribe(queue.clone());

        for line in ["a", "", "b"] {
            assert_eq!(bus.publish(line), 1);
        }
        queue.end();

        assert_eq!(drain.next().await, Some(b"a\n".to_vec()));
        assert_eq!(drain.next().await, Some(b"\n".to_vec()));
        assert_eq!(drain.next().await, Some(b"b\n".to_vec()));
        assert_eq!(drain.next().await, None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let bus = InputBus::new();
        let (queue, _drain) = queue::channel();
        let handle = bus.subscribe(queue);
        let id = handle.id();
        assert_eq!(bus.subscriber_count(), 1);

        assert!(handle.release());
        assert!(!handle.release());
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_release_leaves_other_sessions() {
        let bus = InputBus::new();
        let (queue_a, _drain_a) = queue::channel();
        let (queue_b, _drain_b) = queue::channel();
        let sub_a = bus.subscribe(queue_a);
        let _sub_b = bus.subscribe(queue_b.clone());

        sub_a.release();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish("still here"), 1);
        assert_eq!(queue_b.pushed(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let bus = InputBus::new();
        let (queue, _drain) = queue::channel();
        {
            let _handle = bus.subscribe(queue);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
