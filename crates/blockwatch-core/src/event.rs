//! Invalidation events carried over the message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Name of the durable fanout exchange invalidation events are published to.
pub const EXCHANGE_NAME: &str = "blockchain_events";

/// Notification that new data was written for a source.
///
/// Wire format is a UTF-8 JSON object:
///
/// ```json
/// {"blockchainName": "BTC.main", "occurredOn": "2025-07-29T23:23:13.123Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub blockchain_name: String,
    pub occurred_on: DateTime<Utc>,
}

impl InvalidationEvent {
    /// Create an event for `blockchain_name` stamped with the current time.
    pub fn new(blockchain_name: impl Into<String>) -> Self {
        Self {
            blockchain_name: blockchain_name.into(),
            occurred_on: Utc::now(),
        }
    }

    /// Encode to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire format.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
