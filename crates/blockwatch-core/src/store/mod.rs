//! Snapshot storage gateways.
//!
//! The ingestion side only needs [`SnapshotWriter`] and the read path only
//! needs [`SnapshotReader`]. [`SqliteStore`] implements both over a single
//! SQLite file that the writer and reader processes open independently.

mod schema;
mod sqlite;

pub use schema::{SCHEMA_VERSION, init_schema};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::snapshot::Snapshot;

/// Write side of storage, shaped as a unit of work.
pub trait SnapshotWriter: Send + Sync {
    /// Stage a snapshot for the next [`commit`](Self::commit).
    fn add_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Persist everything staged since the last commit.
    ///
    /// Returns the number of rows written. On error nothing staged is kept.
    fn commit(&self) -> Result<usize>;
}

/// Read side of storage.
pub trait SnapshotReader: Send + Sync {
    /// Most recent snapshot for `name` by ingestion time.
    fn latest(&self, name: &str) -> Result<Option<Snapshot>>;

    /// Up to `limit` snapshots for `name`, newest first.
    fn history(&self, name: &str, limit: usize) -> Result<Vec<Snapshot>>;

    /// One row per source: the most recent by ingestion time.
    fn all_latest(&self) -> Result<Vec<Snapshot>>;

    /// Every stored snapshot.
    fn all(&self) -> Result<Vec<Snapshot>>;

    /// Snapshots ingested within `[start, end]`, newest first.
    fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Snapshot>>;

    /// Total number of stored snapshots.
    fn count(&self) -> Result<u64>;
}
