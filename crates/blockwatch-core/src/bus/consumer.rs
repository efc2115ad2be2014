//! Consumer loop that feeds deliveries to an [`EventHandler`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Delivery, EventHandler, Subscriber, Subscription};
use crate::Result;
use crate::event::InvalidationEvent;
use crate::metrics::Counters;

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Wait before re-subscribing after the stream closes or errors.
    pub reconnect_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled and acknowledged.
    Acked,
    /// Handler failed; returned to the queue for redelivery.
    Requeued,
    /// Payload could not be decoded; dropped.
    Rejected,
}

/// Pulls deliveries one at a time and dispatches them to a handler.
pub struct EventConsumer<H> {
    handler: H,
    config: ConsumerConfig,
    counters: Arc<Counters>,
}

impl<H: EventHandler> EventConsumer<H> {
    pub fn new(handler: H, counters: Arc<Counters>) -> Self {
        Self {
            handler,
            config: ConsumerConfig::default(),
            counters,
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Decode one delivery, run the handler, then ack or nack it.
    pub async fn process_delivery(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome> {
        if delivery.redelivered {
            self.counters.event_redelivered();
        }

        let event = match InvalidationEvent::from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Dropping undecodable event");
                subscription.nack(delivery.tag, false).await?;
                return Ok(DeliveryOutcome::Rejected);
            }
        };

        match self.handler.handle(&event).await {
            Ok(()) => {
                subscription.ack(delivery.tag).await?;
                self.counters.event_consumed();
                debug!(blockchain = %event.blockchain_name, "Event handled");
                Ok(DeliveryOutcome::Acked)
            }
            Err(e) => {
                warn!(
                    blockchain = %event.blockchain_name,
                    error = %e,
                    "Event handler failed, requeueing"
                );
                subscription.nack(delivery.tag, true).await?;
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    /// Consume until cancelled, re-subscribing after `reconnect_delay`
    /// whenever the subscription fails or its stream ends.
    pub async fn run(&self, subscriber: &dyn Subscriber, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribed = subscriber.subscribe() => subscribed,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!("Subscribed to invalidation events");
                    match self.consume(subscription.as_mut(), &cancel).await {
                        Ok(()) if cancel.is_cancelled() => break,
                        Ok(()) => warn!("Event stream closed"),
                        Err(e) => warn!(error = %e, "Event stream failed"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to subscribe to invalidation events"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!("Event consumer stopped");
    }

    async fn consume(
        &self,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = subscription.next_delivery() => next?,
            };
            let Some(delivery) = next else {
                return Ok(());
            };
            self.process_delivery(subscription, delivery).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::Error;
    use crate::bus::{EventPublisher, MemoryBroker};

    /// Records handled names; fails the first `failures` calls.
    #[derive(Default)]
    struct RecordingHandler {
        failures: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &InvalidationEvent) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::BrokerUnavailable("handler down".into()));
            }
            self.seen.lock().push(event.blockchain_name.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSubscription {
        acked: Vec<u64>,
        nacked: Vec<(u64, bool)>,
    }

    #[async_trait]
    impl Subscription for RecordingSubscription {
        async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
            Ok(None)
        }

        async fn ack(&mut self, tag: u64) -> Result<()> {
            self.acked.push(tag);
            Ok(())
        }

        async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
            self.nacked.push((tag, requeue));
            Ok(())
        }
    }

    fn delivery(tag: u64, payload: Vec<u8>) -> Delivery {
        Delivery {
            tag,
            payload,
            redelivered: false,
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            reconnect_delay: Duration::from_millis(10),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked() {
        let counters = Arc::new(Counters::default());
        let consumer = EventConsumer::new(RecordingHandler::default(), counters.clone());
        let mut sub = RecordingSubscription::default();

        let payload = InvalidationEvent::new("BTC.main").to_bytes().unwrap();
        let outcome = consumer
            .process_delivery(&mut sub, delivery(7, payload))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(sub.acked, vec![7]);
        assert!(sub.nacked.is_empty());
        assert_eq!(counters.snapshot().events_consumed, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_requeues() {
        let counters = Arc::new(Counters::default());
        let consumer = EventConsumer::new(RecordingHandler::failing(1), counters);
        let mut sub = RecordingSubscription::default();

        let payload = InvalidationEvent::new("BTC.main").to_bytes().unwrap();
        let outcome = consumer
            .process_delivery(&mut sub, delivery(3, payload))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Requeued);
        assert_eq!(sub.nacked, vec![(3, true)]);
        assert!(sub.acked.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_rejected_without_requeue() {
        let counters = Arc::new(Counters::default());
        let consumer = EventConsumer::new(RecordingHandler::default(), counters);
        let mut sub = RecordingSubscription::default();

        let outcome = consumer
            .process_delivery(&mut sub, delivery(9, b"not json".to_vec()))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Rejected);
        assert_eq!(sub.nacked, vec![(9, false)]);
        assert!(consumer.handler().seen().is_empty());
    }

    #[tokio::test]
    async fn test_run_redelivers_after_handler_failure() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("serve");
        let counters = Arc::new(Counters::default());
        let consumer = Arc::new(
            EventConsumer::new(RecordingHandler::failing(1), counters.clone())
                .with_config(fast_config()),
        );

        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&subscriber, cancel).await })
        };

        broker
            .publish(&InvalidationEvent::new("ETH.main"))
            .await
            .unwrap();
        wait_for(|| !consumer.handler().seen().is_empty()).await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(consumer.handler().seen(), vec!["ETH.main".to_string()]);
        assert_eq!(counters.snapshot().events_redelivered, 1);
        assert_eq!(broker.queue_depth("serve"), 0);
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_outage() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("serve");
        let consumer = Arc::new(
            EventConsumer::new(RecordingHandler::default(), Arc::new(Counters::default()))
                .with_config(fast_config()),
        );

        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&subscriber, cancel).await })
        };

        broker
            .publish(&InvalidationEvent::new("BTC.main"))
            .await
            .unwrap();
        wait_for(|| consumer.handler().seen().len() == 1).await;

        broker.set_available(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.set_available(true);

        broker
            .publish(&InvalidationEvent::new("LTC.main"))
            .await
            .unwrap();
        wait_for(|| consumer.handler().seen().len() == 2).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(
            consumer.handler().seen(),
            vec!["BTC.main".to_string(), "LTC.main".to_string()]
        );
    }

    /// A broker that accepts the connection and never finishes the handshake.
    struct StalledSubscriber;

    #[async_trait]
    impl Subscriber for StalledSubscriber {
        async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_while_subscribing() {
        let counters = Arc::new(Counters::default());
        let consumer = EventConsumer::new(RecordingHandler::default(), counters);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = consumer.run(&StalledSubscriber, cancel);
        tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("consumer did not stop while subscribing");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_while_idle() {
        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("serve");
        let counters = Arc::new(Counters::default());
        let consumer = EventConsumer::new(RecordingHandler::default(), counters);

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), consumer.run(&subscriber, cancel))
            .await
            .expect("consumer did not stop");
    }
}
