//! Upstream client for BlockCypher-style chain endpoints.
//!
//! One call to [`SourceClient::fetch`] is one logical request: it retries on
//! HTTP 429 with exponential backoff and gives up on anything else.
//!
//! ```text
//! attempt 1 ──429──▶ sleep base ──▶ attempt 2 ──429──▶ sleep 2·base ──▶ attempt 3 ──429──▶ RateLimited
//!     │                                  │                                  │
//!    2xx ──▶ decode ──▶ Snapshot        2xx ...                            2xx ...
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockwatch_core::metrics::Counters;
use blockwatch_core::{Snapshot, SourceDescriptor};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Why a fetch produced no snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Every attempt was rate limited.
    #[error("{name}: rate limited after {attempts} attempts")]
    RateLimited { name: String, attempts: u32 },

    /// Upstream answered with a non-success status other than 429.
    #[error("{name}: upstream returned HTTP {status}")]
    Status { name: String, status: u16 },

    /// The request never produced a response.
    #[error("{name}: request failed: {message}")]
    Transport { name: String, message: String },

    /// The response body was not a valid snapshot.
    #[error("{name}: invalid response body: {message}")]
    Decode { name: String, message: String },
}

/// Raw response handed back by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Transport-level failure. `status` is set when the failure still carried an
/// HTTP status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

/// Performs a single HTTP GET.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] over a shared `reqwest` client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .user_agent(concat!("blockwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError {
                status: None,
                message: format!("HTTP client build failed: {e}"),
            })?;
        Ok(Self { client })
    }

    fn describe(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_body() || error.is_decode() {
            "failed to read response body".to_string()
        } else {
            error.to_string()
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let to_error = |e: reqwest::Error| TransportError {
            status: e.status().map(|s| s.as_u16()),
            message: Self::describe(&e),
        };

        let response = self.client.get(url).send().await.map_err(to_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(to_error)?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Retry budget for rate-limited requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first rate-limited attempt; doubles each time.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the rate-limited `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// BlockCypher chain endpoint body.
#[derive(Debug, Deserialize)]
struct UpstreamSnapshot {
    #[serde(default)]
    name: Option<String>,
    height: u64,
    hash: String,
    time: DateTime<Utc>,
    latest_url: Option<String>,
    previous_hash: Option<String>,
    previous_url: Option<String>,
    #[serde(default)]
    peer_count: u32,
    #[serde(default)]
    unconfirmed_count: u32,
    high_fee_per_kb: Option<u64>,
    medium_fee_per_kb: Option<u64>,
    low_fee_per_kb: Option<u64>,
    high_gas_price: Option<u64>,
    medium_gas_price: Option<u64>,
    low_gas_price: Option<u64>,
    high_priority_fee: Option<u64>,
    medium_priority_fee: Option<u64>,
    low_priority_fee: Option<u64>,
    base_fee: Option<u64>,
    last_fork_height: Option<u64>,
    last_fork_hash: Option<String>,
}

impl UpstreamSnapshot {
    fn into_snapshot(self, fallback_name: &str, created_at: DateTime<Utc>) -> Snapshot {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| fallback_name.to_string());

        Snapshot {
            id: None,
            name,
            height: self.height,
            hash: self.hash,
            time: self.time,
            latest_url: self.latest_url,
            previous_hash: self.previous_hash,
            previous_url: self.previous_url,
            peer_count: self.peer_count,
            unconfirmed_count: self.unconfirmed_count,
            high_fee_per_kb: self.high_fee_per_kb,
            medium_fee_per_kb: self.medium_fee_per_kb,
            low_fee_per_kb: self.low_fee_per_kb,
            high_gas_price: self.high_gas_price,
            medium_gas_price: self.medium_gas_price,
            low_gas_price: self.low_gas_price,
            high_priority_fee: self.high_priority_fee,
            medium_priority_fee: self.medium_priority_fee,
            low_priority_fee: self.low_priority_fee,
            base_fee: self.base_fee,
            last_fork_height: self.last_fork_height,
            last_fork_hash: self.last_fork_hash,
            created_at,
        }
    }
}

/// Outcome of a single attempt.
enum AttemptError {
    Retryable,
    Fatal(FetchError),
}

/// Fetches snapshots for configured sources.
#[derive(Clone)]
pub struct SourceClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
}

impl SourceClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            transport,
            retry,
            counters,
        }
    }

    /// Fetch the current snapshot for `source`.
    ///
    /// The returned snapshot has `created_at` set to the time the response
    /// was decoded.
    pub async fn fetch(&self, source: &SourceDescriptor) -> Result<Snapshot, FetchError> {
        let url = source.url();
        let max_attempts = self.retry.max_attempts.max(1);
        debug!(source = %source.name, url = %url, "Fetching snapshot");

        for attempt in 1..=max_attempts {
            match self.attempt(source, &url).await {
                Ok(snapshot) => {
                    self.counters.snapshot_fetched();
                    info!(
                        source = %source.name,
                        height = snapshot.height,
                        attempt,
                        "Fetched snapshot"
                    );
                    return Ok(snapshot);
                }
                Err(AttemptError::Retryable) => {
                    self.counters.rate_limited();
                    if attempt < max_attempts {
                        let delay = self.retry.backoff_delay(attempt);
                        warn!(
                            source = %source.name,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(AttemptError::Fatal(e)) => {
                    self.counters.fetch_failed();
                    error!(source = %source.name, error = %e, "Fetch failed");
                    return Err(e);
                }
            }
        }

        self.counters.fetch_failed();
        let err = FetchError::RateLimited {
            name: source.name.clone(),
            attempts: max_attempts,
        };
        error!(source = %source.name, error = %err, "Giving up");
        Err(err)
    }

    async fn attempt(
        &self,
        source: &SourceDescriptor,
        url: &str,
    ) -> Result<Snapshot, AttemptError> {
        let response = match self.transport.get(url).await {
            Ok(response) => response,
            Err(e) if e.status == Some(STATUS_TOO_MANY_REQUESTS) => {
                return Err(AttemptError::Retryable);
            }
            Err(e) => {
                return Err(AttemptError::Fatal(FetchError::Transport {
                    name: source.name.clone(),
                    message: e.message,
                }));
            }
        };

        if response.status == STATUS_TOO_MANY_REQUESTS {
            return Err(AttemptError::Retryable);
        }
        if !(200..300).contains(&response.status) {
            return Err(AttemptError::Fatal(FetchError::Status {
                name: source.name.clone(),
                status: response.status,
            }));
        }

        let upstream: UpstreamSnapshot = serde_json::from_slice(&response.body).map_err(|e| {
            AttemptError::Fatal(FetchError::Decode {
                name: source.name.clone(),
                message: e.to_string(),
            })
        })?;

        Ok(upstream.into_snapshot(&source.name, Utc::now()))
    }
}


#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::testing::{ScriptedTransport, ok_body, status};
    use super::*;

    const BASE: &str = "https://api.example.test/v1";

    fn btc() -> SourceDescriptor {
        SourceDescriptor::new("btc/main", BASE)
    }

    fn client(transport: Arc<ScriptedTransport>, counters: Arc<Counters>) -> SourceClient {
        SourceClient::new(transport, RetryPolicy::default(), counters)
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.backoff_delay(64),
            Duration::from_millis(2000).saturating_mul(u32::MAX)
        );
    }

    #[tokio::test]
    async fn test_fetch_success_stamps_created_at() {
        let url = btc().url();
        let replies = vec![Ok(ok_body("BTC.main", 840_000))];
        let transport = Arc::new(ScriptedTransport::default().reply(&url, replies));
        let counters = Arc::new(Counters::default());

        let before = Utc::now();
        let snapshot = client(transport.clone(), counters.clone())
            .fetch(&btc())
            .await
            .unwrap();

        assert_eq!(snapshot.name, "BTC.main");
        assert_eq!(snapshot.height, 840_000);
        assert_eq!(snapshot.peer_count, 250);
        assert_eq!(snapshot.medium_fee_per_kb, Some(20000));
        assert!(snapshot.id.is_none());
        assert!(snapshot.created_at >= before);
        assert_ne!(snapshot.created_at, snapshot.time);
        assert_eq!(transport.calls(), 1);
        assert_eq!(counters.snapshot().snapshots_fetched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(
            &url,
            vec![Ok(status(429)), Ok(status(429)), Ok(ok_body("BTC.main", 1))],
        ));
        let counters = Arc::new(Counters::default());

        let start = Instant::now();
        let snapshot = client(transport.clone(), counters.clone())
            .fetch(&btc())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(snapshot.height, 1);
        assert_eq!(transport.calls(), 3);
        assert!(
            elapsed >= Duration::from_millis(6000),
            "elapsed {elapsed:?}"
        );
        assert!(elapsed < Duration::from_millis(6100), "elapsed {elapsed:?}");
        assert_eq!(counters.snapshot().rate_limited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausted() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(&url, vec![Ok(status(429))]));
        let counters = Arc::new(Counters::default());

        let start = Instant::now();
        let err = client(transport.clone(), counters.clone())
            .fetch(&btc())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, FetchError::RateLimited { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
        // No sleep after the final attempt.
        assert!(elapsed < Duration::from_millis(6100), "elapsed {elapsed:?}");
        assert_eq!(counters.snapshot().fetch_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_carrying_429_is_retried() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(
            &url,
            vec![
                Err(TransportError {
                    status: Some(429),
                    message: "too many requests".into(),
                }),
                Ok(ok_body("BTC.main", 2)),
            ],
        ));

        let snapshot = client(transport.clone(), Arc::new(Counters::default()))
            .fetch(&btc())
            .await
            .unwrap();
        assert_eq!(snapshot.height, 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(&url, vec![Ok(status(503))]));

        let err = client(transport.clone(), Arc::new(Counters::default()))
            .fetch(&btc())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Status {
                name: "BTC.main".into(),
                status: 503
            }
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(
            &url,
            vec![Err(TransportError {
                status: None,
                message: "connection refused or unreachable".into(),
            })],
        ));

        let err = client(transport.clone(), Arc::new(Counters::default()))
            .fetch(&btc())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let url = btc().url();
        let transport = Arc::new(ScriptedTransport::default().reply(
            &url,
            vec![Ok(HttpResponse {
                status: 200,
                body: br#"{"height": "tall"}"#.to_vec(),
            })],
        ));

        let err = client(transport, Arc::new(Counters::default()))
            .fetch(&btc())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_missing_upstream_name_uses_descriptor() {
        let url = SourceDescriptor::new("btc/test3", BASE).url();
        let body = serde_json::json!({
            "height": 10,
            "hash": "abc",
            "time": "2025-07-29T23:23:13Z"
        });
        let transport = Arc::new(ScriptedTransport::default().reply(
            &url,
            vec![Ok(HttpResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap(),
            })],
        ));

        let snapshot = client(transport, Arc::new(Counters::default()))
            .fetch(&SourceDescriptor::new("btc/test3", BASE))
            .await
            .unwrap();
        assert_eq!(snapshot.name, "BTC.test3");
        assert_eq!(snapshot.peer_count, 0);
        assert_eq!(snapshot.high_gas_price, None);
    }
}
