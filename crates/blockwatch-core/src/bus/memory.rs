//! In-process fanout broker.
//!
//! Mirrors the AMQP topology closely enough to exercise the delivery
//! contract without a running RabbitMQ: queues are durable (they keep
//! messages while no subscription is open), unacked deliveries go back to the
//! head of the queue when a subscription drops, and the whole broker can be
//! switched off to simulate an outage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Delivery, EventPublisher, Subscriber, Subscription};
use crate::event::InvalidationEvent;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

struct Inner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
}

/// In-process broker with a single fanout exchange.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Declare a durable queue bound to the exchange and return a subscriber
    /// for it. Events published from now on are retained for this queue.
    pub fn subscriber(&self, queue: &str) -> MemorySubscriber {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        MemorySubscriber {
            broker: self.clone(),
            queue: queue.to_string(),
        }
    }

    /// Switch the broker on or off. While off, publish and subscribe fail and
    /// open subscriptions error on their next read.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            for queue in self.inner.state.lock().queues.values() {
                queue.notify.notify_waiters();
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Messages waiting in `queue`, delivered-but-unacked included.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.unacked.len())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("memory broker is offline".to_string()))
        }
    }

    fn requeue(&self, queue: &str, tags: impl IntoIterator<Item = u64>) {
        let mut state = self.inner.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            let mut requeued = false;
            for tag in tags {
                if let Some(mut msg) = q.unacked.remove(&tag) {
                    msg.redelivered = true;
                    q.ready.push_front(msg);
                    requeued = true;
                }
            }
            if requeued {
                q.notify.notify_one();
            }
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, event: &InvalidationEvent) -> Result<()> {
        self.ensure_available()?;
        let payload = event.to_bytes()?;

        let mut state = self.inner.state.lock();
        for queue in state.queues.values_mut() {
            queue.ready.push_back(Message {
                payload: payload.clone(),
                redelivered: false,
            });
            queue.notify.notify_one();
        }
        Ok(())
    }
}

/// Opens subscriptions on one queue of a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    queue: String,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        self.broker.ensure_available()?;
        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            queue: self.queue.clone(),
            held: HashSet::new(),
        }))
    }
}

/// An open consumer on a memory queue.
///
/// Dropping it requeues every delivery it has not acked.
pub struct MemorySubscription {
    broker: MemoryBroker,
    queue: String,
    held: HashSet<u64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        loop {
            self.broker.ensure_available()?;

            let mut notified = {
                let mut state = self.broker.inner.state.lock();
                let BrokerState { queues, next_tag } = &mut *state;
                let Some(queue) = queues.get_mut(&self.queue) else {
                    return Ok(None);
                };

                if let Some(msg) = queue.ready.pop_front() {
                    *next_tag += 1;
                    let tag = *next_tag;
                    let delivery = Delivery {
                        tag,
                        payload: msg.payload.clone(),
                        redelivered: msg.redelivered,
                    };
                    queue.unacked.insert(tag, msg);
                    self.held.insert(tag);
                    return Ok(Some(delivery));
                }

                // Register as a waiter before the lock is released and only
                // then read the flag, so `set_available(false)` either sees
                // this waiter or is seen by it.
                let mut notified = Box::pin(Arc::clone(&queue.notify).notified_owned());
                notified.as_mut().enable();
                self.broker.ensure_available()?;
                notified
            };

            notified.as_mut().await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        if !self.held.remove(&tag) {
            return Err(Error::BrokerUnavailable(format!("unknown delivery tag {tag}")));
        }
        let mut state = self.broker.inner.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked.remove(&tag);
        }
        Ok(())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        if !self.held.remove(&tag) {
            return Err(Error::BrokerUnavailable(format!("unknown delivery tag {tag}")));
        }
        if requeue {
            self.broker.requeue(&self.queue, [tag]);
        } else {
            let mut state = self.broker.inner.state.lock();
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.unacked.remove(&tag);
            }
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let held: Vec<u64> = self.held.drain().collect();
        if !held.is_empty() {
            self.broker.requeue(&self.queue, held);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn publish(broker: &MemoryBroker, name: &str) {
        let event = InvalidationEvent::new(name);
        broker.publish(&event).await.unwrap();
    }

    async fn next_event(sub: &mut Box<dyn Subscription>) -> (u64, InvalidationEvent, bool) {
        let delivery = sub.next_delivery().await.unwrap().unwrap();
        let event = InvalidationEvent::from_bytes(&delivery.payload).unwrap();
        (delivery.tag, event, delivery.redelivered)
    }

    #[tokio::test]
    async fn test_fanout_to_every_queue() {
        let broker = MemoryBroker::new();
        let a = broker.subscriber("serve-a");
        let b = broker.subscriber("serve-b");

        publish(&broker, "BTC.main").await;

        let mut sub_a = a.subscribe().await.unwrap();
        let mut sub_b = b.subscribe().await.unwrap();
        assert_eq!(next_event(&mut sub_a).await.1.blockchain_name, "BTC.main");
        assert_eq!(next_event(&mut sub_b).await.1.blockchain_name, "BTC.main");
    }

    #[tokio::test]
    async fn test_queue_retains_messages_while_disconnected() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("serve-a");

        publish(&broker, "BTC.main").await;
        publish(&broker, "ETH.main").await;
        assert_eq!(broker.queue_depth("serve-a"), 2);

        let mut sub = subscriber.subscribe().await.unwrap();
        let (tag1, first, _) = next_event(&mut sub).await;
        sub.ack(tag1).await.unwrap();
        let (tag2, second, _) = next_event(&mut sub).await;
        sub.ack(tag2).await.unwrap();

        assert_eq!(first.blockchain_name, "BTC.main");
        assert_eq!(second.blockchain_name, "ETH.main");
        assert_eq!(broker.queue_depth("serve-a"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");
        publish(&broker, "LTC.main").await;

        let mut sub = subscriber.subscribe().await.unwrap();
        let (tag, _, redelivered) = next_event(&mut sub).await;
        assert!(!redelivered);
        sub.nack(tag, true).await.unwrap();

        let (tag, event, redelivered) = next_event(&mut sub).await;
        assert!(redelivered);
        assert_eq!(event.blockchain_name, "LTC.main");
        sub.ack(tag).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");
        publish(&broker, "LTC.main").await;

        let mut sub = subscriber.subscribe().await.unwrap();
        let (tag, _, _) = next_event(&mut sub).await;
        sub.nack(tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_requeues_unacked() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");
        publish(&broker, "DASH.main").await;

        {
            let mut sub = subscriber.subscribe().await.unwrap();
            let _ = next_event(&mut sub).await;
        }

        let mut sub = subscriber.subscribe().await.unwrap();
        let (_, event, redelivered) = next_event(&mut sub).await;
        assert_eq!(event.blockchain_name, "DASH.main");
        assert!(redelivered);
    }

    #[tokio::test]
    async fn test_waiting_subscription_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");
        let mut sub = subscriber.subscribe().await.unwrap();

        let publisher = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publish(&publisher, "BTC.main").await;
        });

        let (_, event, _) = next_event(&mut sub).await;
        assert_eq!(event.blockchain_name, "BTC.main");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_broker_rejects_publish_and_subscribe() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");
        broker.set_available(false);

        let err = broker
            .publish(&InvalidationEvent::new("BTC.main"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)));
        assert!(subscriber.subscribe().await.is_err());
        assert_eq!(broker.queue_depth("q"), 0);

        broker.set_available(true);
        publish(&broker, "BTC.main").await;
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_waiting_subscription_errors_when_broker_goes_offline() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("q");

        for _ in 0..50 {
            let mut sub = subscriber.subscribe().await.unwrap();
            let reader = tokio::spawn(async move { sub.next_delivery().await });

            tokio::task::yield_now().await;
            broker.set_available(false);

            let result = tokio::time::timeout(Duration::from_secs(1), reader)
                .await
                .expect("waiting subscription missed the offline signal")
                .unwrap();
            assert!(matches!(result, Err(Error::BrokerUnavailable(_))));
            broker.set_available(true);
        }
    }

    #[tokio::test]
    async fn test_offline_before_wait_is_seen() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscriber("q").subscribe().await.unwrap();
        broker.set_available(false);

        let result = tokio::time::timeout(Duration::from_secs(1), sub.next_delivery())
            .await
            .expect("subscription waited on an offline broker");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ack_unknown_tag_fails() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscriber("q").subscribe().await.unwrap();
        assert!(sub.ack(999).await.is_err());
    }
}
