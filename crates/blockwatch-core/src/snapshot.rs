//! Snapshot records and source descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum length of a source identifier (e.g. `BTC.main`).
pub const MAX_NAME_LEN: usize = 20;

/// One fetched observation of a blockchain source at a point in time.
///
/// Snapshots are append-only: storage assigns `id` on insert and nothing in
/// the system updates a snapshot afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Storage row id, `None` until the snapshot has been committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Source identifier as reported upstream (e.g. `BTC.main`).
    pub name: String,
    /// Block height.
    pub height: u64,
    /// Latest block hash.
    pub hash: String,
    /// Block time reported by the upstream API.
    pub time: DateTime<Utc>,

    pub latest_url: Option<String>,
    pub previous_hash: Option<String>,
    pub previous_url: Option<String>,
    pub peer_count: u32,
    pub unconfirmed_count: u32,

    // Fee tiers (BTC, DASH, LTC).
    pub high_fee_per_kb: Option<u64>,
    pub medium_fee_per_kb: Option<u64>,
    pub low_fee_per_kb: Option<u64>,

    // Gas tiers (ETH).
    pub high_gas_price: Option<u64>,
    pub medium_gas_price: Option<u64>,
    pub low_gas_price: Option<u64>,
    pub high_priority_fee: Option<u64>,
    pub medium_priority_fee: Option<u64>,
    pub low_priority_fee: Option<u64>,
    pub base_fee: Option<u64>,

    pub last_fork_height: Option<u64>,
    pub last_fork_hash: Option<String>,

    /// Ingestion timestamp. Set when the snapshot is fetched, never taken
    /// from the upstream payload.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot with the required fields; everything optional is empty.
    pub fn new(
        name: impl Into<String>,
        height: u64,
        hash: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            height,
            hash: hash.into(),
            time,
            latest_url: None,
            previous_hash: None,
            previous_url: None,
            peer_count: 0,
            unconfirmed_count: 0,
            high_fee_per_kb: None,
            medium_fee_per_kb: None,
            low_fee_per_kb: None,
            high_gas_price: None,
            medium_gas_price: None,
            low_gas_price: None,
            high_priority_fee: None,
            medium_priority_fee: None,
            low_priority_fee: None,
            base_fee: None,
            last_fork_height: None,
            last_fork_hash: None,
            created_at: Utc::now(),
        }
    }

    /// Check the invariants a snapshot must hold before it is persisted.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.height == 0 {
            return Err(Error::Validation {
                field: "height",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.hash.trim().is_empty() {
            return Err(Error::Validation {
                field: "hash",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Validate a source identifier: non-blank and at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }

    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(Error::Validation {
            field: "name",
            reason: format!("{len} characters exceeds maximum of {MAX_NAME_LEN}"),
        });
    }

    Ok(())
}

/// Static configuration entry for one upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Upstream path segment (e.g. `btc/main`).
    pub path: String,
    /// Source identifier derived from the path (e.g. `BTC.main`).
    pub name: String,
    /// Base URL of the upstream API for this source.
    pub base_url: String,
    /// Disabled sources are skipped by the scheduler.
    pub enabled: bool,
}

impl SourceDescriptor {
    /// Create an enabled descriptor for `path` served from `base_url`.
    pub fn new(path: impl Into<String>, base_url: impl Into<String>) -> Self {
        let path = path.into().trim_matches('/').to_string();
        let name = name_from_path(&path);
        Self {
            path,
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enabled: true,
        }
    }

    /// Parse a configuration entry of the form `path` or `path@base_url`.
    pub fn parse(entry: &str, default_base_url: &str) -> Result<Self> {
        let entry = entry.trim();
        let (path, base_url) = match entry.split_once('@') {
            Some((path, base)) => (path.trim(), base.trim()),
            None => (entry, default_base_url),
        };

        if path.is_empty() || !path.contains('/') {
            return Err(Error::Config(format!(
                "invalid source '{entry}': expected '<coin>/<network>'"
            )));
        }

        if base_url.is_empty() {
            return Err(Error::Config(format!("invalid source '{entry}': empty base URL")));
        }

        let descriptor = Self::new(path, base_url);
        validate_name(&descriptor.name)
            .map_err(|e| Error::Config(format!("invalid source '{entry}': {e}")))?;
        Ok(descriptor)
    }

    /// Full URL the source client requests.
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url, self.path)
    }
}

/// Derive the upstream identifier from a path: `btc/test3` becomes `BTC.test3`.
fn name_from_path(path: &str) -> String {
    match path.split_once('/') {
        Some((coin, network)) => format!("{}.{}", coin.to_uppercase(), network),
        None => path.to_uppercase(),
    }
}
