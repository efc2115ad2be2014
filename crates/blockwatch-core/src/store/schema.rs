//! SQLite schema for the snapshot history.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn create_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    create_version_table(conn)?;

    let version: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    create_version_table(conn)?;
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
///
/// Timestamps are stored as Unix microseconds so ordering is a plain integer
/// comparison.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            height INTEGER NOT NULL,
            hash TEXT NOT NULL,
            time_us INTEGER NOT NULL,
            latest_url TEXT,
            previous_hash TEXT,
            previous_url TEXT,
            peer_count INTEGER NOT NULL DEFAULT 0,
            unconfirmed_count INTEGER NOT NULL DEFAULT 0,
            high_fee_per_kb INTEGER,
            medium_fee_per_kb INTEGER,
            low_fee_per_kb INTEGER,
            high_gas_price INTEGER,
            medium_gas_price INTEGER,
            low_gas_price INTEGER,
            high_priority_fee INTEGER,
            medium_priority_fee INTEGER,
            low_priority_fee INTEGER,
            base_fee INTEGER,
            last_fork_height INTEGER,
            last_fork_hash TEXT,
            created_at_us INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_name_created
            ON snapshots(name, created_at_us);
        "#,
    )?;

    Ok(())
}

/// Run migrations from one version to another.
fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        if version == 1 {
            migrate_v1_to_v2(conn)?;
        }
    }
    set_schema_version(conn, to)?;
    Ok(())
}

/// Migrate from v1 to v2: add the (name, created_at) composite index used by
/// the latest/history queries.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_snapshots_name_created
            ON snapshots(name, created_at_us);
        "#,
    )?;
    Ok(())
}
