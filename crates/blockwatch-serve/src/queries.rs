//! Read-through snapshot queries.

use std::sync::Arc;

use blockwatch_core::store::SnapshotReader;
use blockwatch_core::{MAX_HISTORY_LIMIT, Result, Snapshot};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cache::{CacheDurations, CacheService, keys};

/// Serves snapshot reads from the cache, falling back to storage on a miss.
#[derive(Clone)]
pub struct SnapshotQueries {
    reader: Arc<dyn SnapshotReader>,
    cache: CacheService,
    durations: CacheDurations,
}

impl SnapshotQueries {
    pub fn new(
        reader: Arc<dyn SnapshotReader>,
        cache: CacheService,
        durations: CacheDurations,
    ) -> Self {
        Self {
            reader,
            cache,
            durations,
        }
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    /// Every stored snapshot.
    pub async fn all(&self) -> Result<Vec<Snapshot>> {
        self.cache
            .get_or_compute(keys::ALL_DATA, self.durations.all_data, || async {
                self.reader.all()
            })
            .await
    }

    /// Latest snapshot for `name`. A missing source is not cached.
    pub async fn latest(&self, name: &str) -> Result<Option<Snapshot>> {
        let key = keys::latest(name);
        if let Some(snapshot) = self.cache.get::<Snapshot>(&key).await {
            return Ok(Some(snapshot));
        }

        let snapshot = self.reader.latest(name)?;
        if let Some(snapshot) = &snapshot {
            self.cache
                .set(&key, snapshot, Some(self.durations.latest))
                .await;
        }
        Ok(snapshot)
    }

    /// Up to `limit` snapshots for `name`, newest first.
    ///
    /// The cache always holds the newest [`MAX_HISTORY_LIMIT`] rows so any
    /// smaller page is served from one entry.
    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let mut rows: Vec<Snapshot> = self
            .cache
            .get_or_compute(&keys::history(name), self.durations.history, || async {
                self.reader.history(name, MAX_HISTORY_LIMIT)
            })
            .await?;

        rows.truncate(limit.min(MAX_HISTORY_LIMIT));
        Ok(rows)
    }

    /// Latest snapshot of every source.
    pub async fn latest_all(&self) -> Result<Vec<Snapshot>> {
        self.cache
            .get_or_compute(keys::LATEST_ALL, self.durations.latest_all, || async {
                self.reader.all_latest()
            })
            .await
    }

    /// Total stored snapshots. A cached zero is served as-is.
    pub async fn total_records(&self) -> Result<u64> {
        self.cache
            .get_or_compute(keys::TOTAL_RECORDS, self.durations.total_records, || async {
                self.reader.count()
            })
            .await
    }

    /// Snapshots ingested in `[start, end]`, newest first. Ranges are
    /// arbitrary, so this always reads storage.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        self.reader.between(start, end)
    }

    /// Drop every cached view that a new snapshot for `name` makes stale.
    /// Returns how many keys were actually present.
    pub async fn invalidate_related(&self, name: &str) -> usize {
        let mut removed = 0;
        for key in keys::related(name) {
            if self.cache.remove(&key).await {
                removed += 1;
            }
        }
        debug!(blockchain = %name, removed, "Invalidated related cache keys");
        removed
    }
}
