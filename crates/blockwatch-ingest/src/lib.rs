//! Blockwatch ingestion components.
//!
//! # Modules
//!
//! - [`client`] - Upstream HTTP client with rate-limit backoff
//! - [`scheduler`] - Sequential multi-source ingestion loop
//! - [`config`] - Environment configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Scheduler    │  one tick per interval, sources in order
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  SourceClient   │  GET {base}/{coin}/{network}, backoff on 429
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ SnapshotWriter  │  SQLite, one commit per snapshot
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ EventPublisher  │  fanout exchange → every reader's cache
//! └─────────────────┘
//! ```
//!
//! Storage is the source of truth; the published event only tells readers
//! their cached view of a source is stale.

pub mod client;
pub mod config;
pub mod scheduler;

pub use client::{FetchError, HttpTransport, RetryPolicy, SourceClient, Transport};
pub use config::IngestConfig;
pub use scheduler::{Phase, Scheduler, SchedulerConfig, TickReport};
