//! Prometheus metrics helpers and in-process counters.
//!
//! Two layers live here:
//!
//! - The Prometheus recorder ([`init_metrics`], [`start_metrics_server`]) that
//!   backs the `metrics` macros and serves `/metrics`.
//! - [`Counters`], a set of atomic counters passed by `Arc` to the components
//!   that update them. Every increment is mirrored into the `metrics` facade,
//!   so the same numbers appear on `/metrics` and in [`Counters::snapshot`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use blockwatch_core::metrics::{init_metrics, start_metrics_server, Counters};
//!
//! let handle = init_metrics();
//! start_metrics_server(9091, handle).await?;
//!
//! let counters = Arc::new(Counters::default());
//! counters.cache_hit();
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`fetch_`, `store_`, `cache_`, `events_`)
//! - Suffix: `_total` for counters

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{Router, routing::get};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server on `port`.
///
/// Binds before returning so a port conflict surfaces as an error, then serves
/// `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // Ingestion
    describe_counter!(
        "fetch_snapshots_total",
        "Snapshots fetched successfully from upstream"
    );
    describe_counter!(
        "fetch_rate_limited_total",
        "Upstream responses signalling rate limiting (HTTP 429)"
    );
    describe_counter!(
        "fetch_failures_total",
        "Fetches that ended in failure after retries"
    );
    describe_counter!(
        "store_snapshots_persisted_total",
        "Snapshots committed to storage"
    );
    describe_counter!(
        "store_persist_failures_total",
        "Snapshots that failed validation or commit"
    );

    // Event bus
    describe_counter!(
        "events_published_total",
        "Invalidation events published to the broker"
    );
    describe_counter!(
        "events_publish_failures_total",
        "Invalidation events that could not be published"
    );
    describe_counter!(
        "events_consumed_total",
        "Invalidation events processed and acknowledged"
    );
    describe_counter!(
        "events_redelivered_total",
        "Invalidation events received again after a failed or interrupted delivery"
    );

    // Cache
    describe_counter!("cache_hits_total", "Cache lookups served from cache");
    describe_counter!(
        "cache_misses_total",
        "Cache lookups that fell through to storage"
    );
    describe_counter!(
        "cache_invalidations_total",
        "Cache keys removed by invalidation events"
    );
}

/// In-process counters shared by reference between components.
#[derive(Debug, Default)]
pub struct Counters {
    snapshots_fetched: AtomicU64,
    rate_limited: AtomicU64,
    fetch_failures: AtomicU64,
    snapshots_persisted: AtomicU64,
    persist_failures: AtomicU64,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    events_consumed: AtomicU64,
    events_redelivered: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_invalidations: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub snapshots_fetched: u64,
    pub rate_limited: u64,
    pub fetch_failures: u64,
    pub snapshots_persisted: u64,
    pub persist_failures: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub events_consumed: u64,
    pub events_redelivered: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_invalidations: u64,
}

#[inline]
fn bump(counter: &AtomicU64, name: &'static str, count: u64) {
    counter.fetch_add(count, Ordering::Relaxed);
    metrics::counter!(name).increment(count);
}

impl Counters {
    pub fn snapshot_fetched(&self) {
        bump(&self.snapshots_fetched, "fetch_snapshots_total", 1);
    }

    pub fn rate_limited(&self) {
        bump(&self.rate_limited, "fetch_rate_limited_total", 1);
    }

    pub fn fetch_failed(&self) {
        bump(&self.fetch_failures, "fetch_failures_total", 1);
    }

    pub fn snapshots_persisted(&self, count: u64) {
        bump(
            &self.snapshots_persisted,
            "store_snapshots_persisted_total",
            count,
        );
    }

    pub fn persist_failed(&self) {
        bump(&self.persist_failures, "store_persist_failures_total", 1);
    }

    pub fn event_published(&self) {
        bump(&self.events_published, "events_published_total", 1);
    }

    pub fn publish_failed(&self) {
        bump(&self.publish_failures, "events_publish_failures_total", 1);
    }

    pub fn event_consumed(&self) {
        bump(&self.events_consumed, "events_consumed_total", 1);
    }

    pub fn event_redelivered(&self) {
        bump(&self.events_redelivered, "events_redelivered_total", 1);
    }

    pub fn cache_hit(&self) {
        bump(&self.cache_hits, "cache_hits_total", 1);
    }

    pub fn cache_miss(&self) {
        bump(&self.cache_misses, "cache_misses_total", 1);
    }

    pub fn cache_invalidated(&self, keys: u64) {
        bump(&self.cache_invalidations, "cache_invalidations_total", keys);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            snapshots_fetched: load(&self.snapshots_fetched),
            rate_limited: load(&self.rate_limited),
            fetch_failures: load(&self.fetch_failures),
            snapshots_persisted: load(&self.snapshots_persisted),
            persist_failures: load(&self.persist_failures),
            events_published: load(&self.events_published),
            publish_failures: load(&self.publish_failures),
            events_consumed: load(&self.events_consumed),
            events_redelivered: load(&self.events_redelivered),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_invalidations: load(&self.cache_invalidations),
        }
    }
}
