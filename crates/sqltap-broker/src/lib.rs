// In-process fan-out broker for captured query events.
//
// Each subscriber owns a bounded queue; publish enqueues with `try_send` so
// one slow consumer can neither block the publisher nor starve its peers. A
// full queue drops the event for that subscriber only.
use sqltap_common::Event;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const DEFAULT_BUFFER: usize = 256;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Event>>,
}

/// Multi-subscriber event fan-out.
///
/// ```no_run
/// use sqltap_broker::Broker;
/// use sqltap_common::{Event, Op};
///
/// async fn tail(broker: &Broker) {
///     let mut sub = broker.subscribe();
///     broker.publish(Event::new("1".into(), Op::Query, "SELECT 1"));
///     let ev = sub.recv().await.expect("event");
///     assert_eq!(ev.query, "SELECT 1");
/// }
/// ```
pub struct Broker {
    buffer: usize,
    registry: Arc<Mutex<Registry>>,
}

impl Broker {
    /// `buffer` is the queue capacity given to every new subscriber.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Register a new subscriber with a fresh bounded queue.
    ///
    /// The returned [`Subscription`] yields events in publish order and
    /// unsubscribes when dropped.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Deliver `event` to every live subscriber without blocking.
    ///
    /// Subscribers whose queue is full miss this event; everyone else still
    /// receives it. Never errors.
    pub fn publish(&self, event: Event) {
        let registry = lock(&self.registry);
        for tx in registry.subscribers.values() {
            if tx.try_send(event.clone()).is_err() {
                metrics::counter!("sqltap_broker_dropped_total").increment(1);
            }
        }
        metrics::counter!("sqltap_broker_published_total").increment(1);
    }

    /// Number of live subscribers, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One subscriber's view of the event stream.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    /// Next event in publish order, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking variant for drain loops and tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.registry).subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltap_common::{Event, Op};

    fn event(id: u64) -> Event {
        Event::new(id.to_string(), Op::Query, format!("SELECT {id}"))
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = Broker::new(16);
        let mut sub = broker.subscribe();

        for i in 0..5 {
            broker.publish(event(i));
        }
        for i in 0..5 {
            let ev = sub.recv().await.expect("event");
            assert_eq!(ev.id, i.to_string());
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let broker = Broker::new(16);
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        broker.publish(event(1));

        assert_eq!(first.recv().await.expect("first").id, "1");
        assert_eq!(second.recv().await.expect("second").id, "1");
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_subscriber_only() {
        let capacity = 4;
        let broker = Broker::new(capacity);
        let mut blocked = broker.subscribe();
        let mut healthy = broker.subscribe();

        // Publish more than the blocked subscriber can hold while it is not
        // reading. The healthy subscriber drains as we go.
        let total = capacity + 3;
        let mut healthy_seen = 0;
        for i in 0..total {
            broker.publish(event(i as u64));
            while healthy.try_recv().is_some() {
                healthy_seen += 1;
            }
        }
        while healthy.try_recv().is_some() {
            healthy_seen += 1;
        }
        assert_eq!(healthy_seen, total, "unblocked subscriber sees everything");

        // The blocked subscriber got exactly its capacity, oldest first.
        let mut blocked_seen = Vec::new();
        while let Some(ev) = blocked.try_recv() {
            blocked_seen.push(ev.id);
        }
        assert_eq!(blocked_seen.len(), capacity);
        let expected: Vec<String> = (0..capacity).map(|i| i.to_string()).collect();
        assert_eq!(blocked_seen, expected);
    }

    #[tokio::test]
    async fn fewer_than_capacity_events_all_arrive() {
        let capacity = 8;
        let broker = Broker::new(capacity);
        let mut sub = broker.subscribe();

        for i in 0..capacity - 1 {
            broker.publish(event(i as u64));
        }
        for i in 0..capacity - 1 {
            assert_eq!(sub.recv().await.expect("event").id, i.to_string());
        }
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let broker = Broker::new(4);
        let sub = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);

        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);

        // Publishing after unsubscribe delivers to nobody and does not panic.
        broker.publish(event(1));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let broker = Broker::default();
        broker.publish(event(1));
    }
}
