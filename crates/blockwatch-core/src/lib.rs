//! Core types and shared plumbing for the blockwatch snapshot pipeline.
//!
//! This crate provides:
//! - The [`Snapshot`] record and [`SourceDescriptor`] with validation
//! - The [`InvalidationEvent`] wire format
//! - Storage gateway traits and the SQLite implementation ([`store`])
//! - The fanout event bus with AMQP and in-memory brokers ([`bus`])
//! - Prometheus metrics helpers and injected counters ([`metrics`])
//! - Environment config helpers ([`config`])
//! - Shared error types

pub mod bus;
pub mod config;
mod error;
mod event;
pub mod metrics;
mod snapshot;
pub mod store;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Largest history page a caller may request. History is cached at this size.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// History page size when the caller gives none.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

pub use error::{Error, Result};
pub use event::{EXCHANGE_NAME, InvalidationEvent};
pub use snapshot::{MAX_NAME_LEN, Snapshot, SourceDescriptor, validate_name};
