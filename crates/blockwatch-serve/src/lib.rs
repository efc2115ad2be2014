//! Blockwatch Serve - HTTP read API for blockchain snapshots
//!
//! Reads go through a per-process cache in front of the shared SQLite
//! history. The cache stays coherent with storage through invalidation events
//! published by the ingestion daemon: each serve instance consumes its own
//! durable queue and drops the keys related to the source named in the event.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (queries, counters, configuration)
//! - **SnapshotQueries**: Read-through cache over the snapshot store
//! - **InvalidationHandler**: Event handler that drops stale cache keys
//! - **Routes**: Endpoint handlers grouped by domain

pub mod cache;
mod error;
pub mod invalidation;
pub mod queries;
mod routes;
mod state;

pub use self::cache::{CacheDurations, CacheService};
pub use self::error::ApiError;
pub use self::invalidation::InvalidationHandler;
pub use self::queries::SnapshotQueries;
pub use self::routes::router;
pub use self::state::{AppState, Config};
