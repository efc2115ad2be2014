//! In-memory snapshot cache with moka.
//!
//! Every entry carries its own TTL, chosen by query class when it is written.
//! Entries are stored as serialized JSON so any `Serialize` result can be
//! cached under a string key.
//!
//! ## Cache Key Namespace
//!
//! | Key | Holds |
//! |-----|-------|
//! | `all_blockchain_data` | every stored snapshot |
//! | `latest_data_all_blockchains` | latest snapshot per source |
//! | `latest_blockchain_data_{name}` | latest snapshot for one source |
//! | `blockchain_history_{name}` | newest 1000 snapshots for one source |
//! | `total_blockchain_records` | total row count |
//!
//! ## TTL Defaults
//!
//! | Query class | TTL |
//! |-------------|-----|
//! | all data | 2 min |
//! | latest (one source) | 1 min |
//! | history | 5 min |
//! | latest across all | 2 min |
//! | total records | 10 min |
//! | anything else | 5 min |

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockwatch_core::metrics::Counters;
use moka::Expiry;
use moka::future::Cache;
use serde::{Serialize, de::DeserializeOwned};

/// Default cache capacity (number of entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Cache keys shared by the query service and invalidation.
pub mod keys {
    pub const ALL_DATA: &str = "all_blockchain_data";
    pub const LATEST_ALL: &str = "latest_data_all_blockchains";
    pub const TOTAL_RECORDS: &str = "total_blockchain_records";

    pub fn latest(name: &str) -> String {
        format!("latest_blockchain_data_{name}")
    }

    pub fn history(name: &str) -> String {
        format!("blockchain_history_{name}")
    }

    /// Every key whose value can change when `name` gets a new snapshot.
    pub fn related(name: &str) -> [String; 5] {
        [
            ALL_DATA.to_string(),
            LATEST_ALL.to_string(),
            latest(name),
            history(name),
            TOTAL_RECORDS.to_string(),
        ]
    }
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// TTL per query class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheDurations {
    pub default: Duration,
    pub all_data: Duration,
    pub latest: Duration,
    pub history: Duration,
    pub latest_all: Duration,
    pub total_records: Duration,
}

impl Default for CacheDurations {
    fn default() -> Self {
        Self {
            default: minutes(5),
            all_data: minutes(2),
            latest: minutes(1),
            history: minutes(5),
            latest_all: minutes(2),
            total_records: minutes(10),
        }
    }
}

/// Cached value with metadata.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    /// Serialized JSON value.
    pub json: Arc<str>,
    /// When this entry was cached.
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub ttl: Duration,
    /// Past this instant the entry is never served.
    pub expires_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Keyed cache with per-entry expiry. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct CacheService {
    cache: Cache<String, CachedEntry>,
    default_ttl: Duration,
    counters: Arc<Counters>,
}

impl CacheService {
    pub fn new(capacity: u64, default_ttl: Duration, counters: Arc<Counters>) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            default_ttl,
            counters,
        }
    }

    /// Look up `key`. `None` is a miss: absent, expired, or not decodable as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(entry) = self.cache.get(key).await else {
            self.counters.cache_miss();
            tracing::debug!(key = %key, "cache miss");
            return None;
        };

        if entry.is_expired(Instant::now()) {
            self.cache.invalidate(key).await;
            self.counters.cache_miss();
            tracing::debug!(key = %key, "cache entry expired");
            return None;
        }

        match serde_json::from_str(&entry.json) {
            Ok(value) => {
                self.counters.cache_hit();
                tracing::debug!(key = %key, cached_at = %entry.cached_at, "cache hit");
                Some(value)
            }
            Err(e) => {
                // Corrupted entry: drop it and report a miss.
                tracing::warn!(key = %key, error = %e, "failed to deserialize cached entry");
                self.cache.invalidate(key).await;
                self.counters.cache_miss();
                None
            }
        }
    }

    /// Store `value` under `key`, replacing any existing entry. `None` uses
    /// the default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to serialize for cache");
                return;
            }
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CachedEntry {
            json: json.into(),
            cached_at: chrono::Utc::now(),
            ttl,
            expires_at: Instant::now() + ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        tracing::debug!(key = %key, ttl_secs = ttl.as_secs_f64(), "cached");
    }

    /// Remove `key`. Returns whether an entry was present; absent keys are a no-op.
    pub async fn remove(&self, key: &str) -> bool {
        self.cache.remove(key).await.is_some()
    }

    /// Whether an unexpired entry exists for `key`. Does not touch hit/miss counters.
    pub async fn exists(&self, key: &str) -> bool {
        self.cache
            .get(key)
            .await
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Get a cached value or compute and cache it with `ttl`.
    ///
    /// Errors from `compute` are returned and nothing is cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, Some(ttl)).await;
        Ok(value)
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
