//! SQLite-backed snapshot store.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};

use super::schema::init_schema;
use super::{SnapshotReader, SnapshotWriter};
use crate::snapshot::Snapshot;
use crate::{Error, Result};

const COLUMNS: &str = "id, name, height, hash, time_us, latest_url, previous_hash, previous_url, \
     peer_count, unconfirmed_count, high_fee_per_kb, medium_fee_per_kb, low_fee_per_kb, \
     high_gas_price, medium_gas_price, low_gas_price, high_priority_fee, medium_priority_fee, \
     low_priority_fee, base_fee, last_fork_height, last_fork_hash, created_at_us";

/// Snapshot store over a single SQLite connection.
///
/// Thread-safe: the connection and the pending unit of work are each behind a
/// mutex. Both the ingest and serve processes open the same file; WAL mode
/// lets readers proceed while the writer commits.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pending: Mutex<Vec<Snapshot>>,
}

impl SqliteStore {
    /// Open or create the store at `path`.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening snapshot store at {}", path.display());
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pending: Mutex::new(Vec::new()),
        })
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, row_to_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl SnapshotWriter for SqliteStore {
    fn add_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        snapshot.validate()?;
        self.pending.lock().push(snapshot.clone());
        Ok(snapshot)
    }

    fn commit(&self) -> Result<usize> {
        let staged = std::mem::take(&mut *self.pending.lock());
        if staged.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshots (
                    name, height, hash, time_us, latest_url, previous_hash, previous_url,
                    peer_count, unconfirmed_count, high_fee_per_kb, medium_fee_per_kb,
                    low_fee_per_kb, high_gas_price, medium_gas_price, low_gas_price,
                    high_priority_fee, medium_priority_fee, low_priority_fee, base_fee,
                    last_fork_height, last_fork_hash, created_at_us
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for s in &staged {
                stmt.execute(params![
                    s.name,
                    to_i64(s.height, "height")?,
                    s.hash,
                    s.time.timestamp_micros(),
                    s.latest_url,
                    s.previous_hash,
                    s.previous_url,
                    s.peer_count,
                    s.unconfirmed_count,
                    opt_i64(s.high_fee_per_kb, "high_fee_per_kb")?,
                    opt_i64(s.medium_fee_per_kb, "medium_fee_per_kb")?,
                    opt_i64(s.low_fee_per_kb, "low_fee_per_kb")?,
                    opt_i64(s.high_gas_price, "high_gas_price")?,
                    opt_i64(s.medium_gas_price, "medium_gas_price")?,
                    opt_i64(s.low_gas_price, "low_gas_price")?,
                    opt_i64(s.high_priority_fee, "high_priority_fee")?,
                    opt_i64(s.medium_priority_fee, "medium_priority_fee")?,
                    opt_i64(s.low_priority_fee, "low_priority_fee")?,
                    opt_i64(s.base_fee, "base_fee")?,
                    opt_i64(s.last_fork_height, "last_fork_height")?,
                    s.last_fork_hash,
                    s.created_at.timestamp_micros(),
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = staged.len(), "committed snapshots");
        Ok(staged.len())
    }
}

impl SnapshotReader for SqliteStore {
    fn latest(&self, name: &str) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM snapshots WHERE name = ?
             ORDER BY created_at_us DESC, id DESC LIMIT 1"
        );
        Ok(self.query(&sql, [name])?.into_iter().next())
    }

    fn history(&self, name: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {COLUMNS} FROM snapshots WHERE name = ?
             ORDER BY created_at_us DESC, id DESC LIMIT ?"
        );
        self.query(&sql, params![name, limit])
    }

    fn all_latest(&self) -> Result<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM snapshots s
             WHERE s.id = (
                 SELECT i.id FROM snapshots i WHERE i.name = s.name
                 ORDER BY i.created_at_us DESC, i.id DESC LIMIT 1
             )
             ORDER BY s.name"
        );
        self.query(&sql, [])
    }

    fn all(&self) -> Result<Vec<Snapshot>> {
        let sql = format!("SELECT {COLUMNS} FROM snapshots ORDER BY id");
        self.query(&sql, [])
    }

    fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM snapshots
             WHERE created_at_us >= ? AND created_at_us <= ?
             ORDER BY created_at_us DESC, id DESC"
        );
        self.query(
            &sql,
            params![start.timestamp_micros(), end.timestamp_micros()],
        )
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Validation {
        field,
        reason: format!("{value} does not fit in a signed 64-bit column"),
    })
}

fn opt_i64(value: Option<u64>, field: &'static str) -> Result<Option<i64>> {
    value.map(|v| to_i64(v, field)).transpose()
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    u64::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, v))
}

fn get_opt_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let v: Option<i64> = row.get(idx)?;
    v.map(|v| u64::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, v)))
        .transpose()
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let us: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        height: get_u64(row, 2)?,
        hash: row.get(3)?,
        time: get_time(row, 4)?,
        latest_url: row.get(5)?,
        previous_hash: row.get(6)?,
        previous_url: row.get(7)?,
        peer_count: row.get(8)?,
        unconfirmed_count: row.get(9)?,
        high_fee_per_kb: get_opt_u64(row, 10)?,
        medium_fee_per_kb: get_opt_u64(row, 11)?,
        low_fee_per_kb: get_opt_u64(row, 12)?,
        high_gas_price: get_opt_u64(row, 13)?,
        medium_gas_price: get_opt_u64(row, 14)?,
        low_gas_price: get_opt_u64(row, 15)?,
        high_priority_fee: get_opt_u64(row, 16)?,
        medium_priority_fee: get_opt_u64(row, 17)?,
        low_priority_fee: get_opt_u64(row, 18)?,
        base_fee: get_opt_u64(row, 19)?,
        last_fork_height: get_opt_u64(row, 20)?,
        last_fork_hash: row.get(21)?,
        created_at: get_time(row, 22)?,
    })
}
