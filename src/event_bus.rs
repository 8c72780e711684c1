// =============================================================================
// Event Bus — non-blocking, best-effort broadcast to WebSocket subscribers
// =============================================================================
//
// Every state mutation that matters to a connected dashboard publishes onto
// this bus instead of being discovered by polling `state_version`. Each
// subscriber gets its own bounded queue; a slow or stalled consumer can never
// make `publish` block, and never makes any other subscriber wait. When a
// subscriber's queue is full, the oldest queued event is dropped and a
// per-subscriber counter is incremented so the consumer can tell it missed
// something instead of silently falling behind.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

/// A single subscriber's mailbox: a bounded ring buffer plus a `Notify` the
/// publishing side pings so `recv` doesn't have to poll.
struct Subscriber<T> {
    queue: RwLock<VecDeque<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> Subscriber<T> {
    fn new() -> Self {
        Self {
            queue: RwLock::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }
}

/// A bounded, multi-subscriber, single-publisher broadcast bus.
///
/// `publish` never blocks on a subscriber and never returns an error: a full
/// queue just loses its oldest entry. This mirrors the push model the
/// dashboard WebSocket feed needs — recency matters far more than full
/// delivery of every intermediate state.
pub struct EventBus<T> {
    capacity: usize,
    subscribers: RwLock<HashMap<String, Arc<Subscriber<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    /// Create a new bus. `capacity` bounds each subscriber's queue depth, not
    /// the number of subscribers.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new subscriber. The returned [`Subscription`] unregisters
    /// itself on drop.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let id = Uuid::new_v4().to_string();
        let sub = Arc::new(Subscriber::new());
        self.subscribers.write().insert(id.clone(), sub.clone());
        Subscription {
            id,
            bus: Arc::clone(self),
            sub,
        }
    }

    /// Broadcast an event to every current subscriber.
    ///
    /// Cloning `T` once per subscriber is the cost of fan-out; callers should
    /// keep `T` cheap to clone (an `Arc`-wrapped payload, a version number, a
    /// small enum) rather than a full deep state snapshot.
    pub fn publish(&self, event: T) {
        let subscribers = self.subscribers.read();
        for sub in subscribers.values() {
            let mut queue = sub.queue.write();
            if queue.len() >= self.capacity {
                queue.pop_front();
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// Number of currently registered subscribers, for observability.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn unsubscribe(&self, id: &str) {
        self.subscribers.write().remove(id);
    }
}

/// A live subscription to an [`EventBus`]. Dropping it removes the
/// subscriber's mailbox from the bus.
pub struct Subscription<T> {
    id: String,
    bus: Arc<EventBus<T>>,
    sub: Arc<Subscriber<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    /// Wait for and return the next queued event, oldest first.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(event) = self.sub.queue.write().pop_front() {
                return event;
            }
            self.sub.notify.notified().await;
        }
    }

    /// Non-blocking: returns the next event if one is already queued.
    pub fn try_recv(&self) -> Option<T> {
        self.sub.queue.write().pop_front()
    }

    /// Number of events dropped for this subscriber because its queue was
    /// full when they were published.
    pub fn dropped_count(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_events_in_order() {
        let bus: Arc<EventBus<u64>> = EventBus::new(8);
        let sub = bus.subscribe();
        bus.publish(1);
        bus.publish(2);
        bus.publish(3);
        assert_eq!(sub.recv().await, 1);
        assert_eq!(sub.recv().await, 2);
        assert_eq!(sub.recv().await, 3);
    }

    #[tokio::test]
    async fn drops_oldest_and_counts_when_full() {
        let bus: Arc<EventBus<u64>> = EventBus::new(2);
        let sub = bus.subscribe();
        bus.publish(1);
        bus.publish(2);
        bus.publish(3); // queue full at publish time of 3 -> drops 1
        assert_eq!(sub.dropped_count(), 1);
        assert_eq!(sub.recv().await, 2);
        assert_eq!(sub.recv().await, 3);
    }

    #[tokio::test]
    async fn publish_never_blocks_on_idle_subscriber() {
        let bus: Arc<EventBus<u64>> = EventBus::new(1);
        let slow = bus.subscribe();
        for i in 0..1000u64 {
            bus.publish(i);
        }
        assert_eq!(slow.dropped_count(), 999);
        assert_eq!(slow.recv().await, 999);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop_removes_mailbox() {
        let bus: Arc<EventBus<u64>> = EventBus::new(4);
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_full_stream() {
        let bus: Arc<EventBus<u64>> = EventBus::new(8);
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(42);
        assert_eq!(a.recv().await, 42);
        assert_eq!(b.recv().await, 42);
    }
}
