//! Cache invalidation driven by bus events.

use std::sync::Arc;

use async_trait::async_trait;
use blockwatch_core::bus::EventHandler;
use blockwatch_core::metrics::Counters;
use blockwatch_core::{InvalidationEvent, Result};

use crate::queries::SnapshotQueries;

/// Drops every cache key related to the source named in each event.
///
/// Removal is idempotent, so redelivered events are harmless.
pub struct InvalidationHandler {
    queries: SnapshotQueries,
    counters: Arc<Counters>,
}

impl InvalidationHandler {
    pub fn new(queries: SnapshotQueries, counters: Arc<Counters>) -> Self {
        Self { queries, counters }
    }
}

#[async_trait]
impl EventHandler for InvalidationHandler {
    async fn handle(&self, event: &InvalidationEvent) -> Result<()> {
        let removed = self
            .queries
            .invalidate_related(&event.blockchain_name)
            .await;
        self.counters.cache_invalidated(removed as u64);
        tracing::info!(
            blockchain = %event.blockchain_name,
            occurred_on = %event.occurred_on,
            removed,
            "Cache invalidated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blockwatch_core::bus::{EventConsumer, EventPublisher, MemoryBroker};
    use blockwatch_core::store::SqliteStore;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cache::{CacheDurations, CacheService, keys};
    use crate::queries::testing::{CountingReader, seed};

    fn warm_queries() -> (SnapshotQueries, Arc<Counters>) {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "BTC.main", 3);
        let counters = Arc::new(Counters::default());
        let cache = CacheService::new(100, Duration::from_secs(300), counters.clone());
        let queries = SnapshotQueries::new(
            Arc::new(CountingReader::new(store)),
            cache,
            CacheDurations::default(),
        );
        (queries, counters)
    }

    async fn warm(queries: &SnapshotQueries) {
        queries.all().await.unwrap();
        queries.latest_all().await.unwrap();
        queries.latest("BTC.main").await.unwrap();
        queries.history("BTC.main", 10).await.unwrap();
        queries.total_records().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_removes_all_related_keys() {
        let (queries, counters) = warm_queries();
        warm(&queries).await;
        for key in keys::related("BTC.main") {
            assert!(queries.cache().exists(&key).await, "{key} should be cached");
        }

        let handler = InvalidationHandler::new(queries.clone(), counters.clone());
        handler
            .handle(&InvalidationEvent::new("BTC.main"))
            .await
            .unwrap();

        for key in keys::related("BTC.main") {
            assert!(!queries.cache().exists(&key).await, "{key} should be gone");
        }
        assert_eq!(counters.snapshot().cache_invalidations, 5);

        // Redelivery is a no-op.
        handler
            .handle(&InvalidationEvent::new("BTC.main"))
            .await
            .unwrap();
        assert_eq!(counters.snapshot().cache_invalidations, 5);
    }

    #[tokio::test]
    async fn test_event_over_bus_invalidates_cache() {
        let (queries, counters) = warm_queries();
        warm(&queries).await;

        let broker = MemoryBroker::new();
        let subscriber = broker.subscriber("api_cache_invalidation");
        let consumer = Arc::new(EventConsumer::new(
            InvalidationHandler::new(queries.clone(), counters.clone()),
            counters.clone(),
        ));

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

        tokio::time::timeout(Duration::from_secs(5), async {
            while counters.snapshot().events_consumed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();

        for key in keys::related("BTC.main") {
            assert!(!queries.cache().exists(&key).await);
        }
        assert_eq!(broker.queue_depth("api_cache_invalidation"), 0);
    }
}
