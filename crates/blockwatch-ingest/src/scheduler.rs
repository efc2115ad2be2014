//! Periodic ingestion loop.
//!
//! Each tick walks the enabled sources in order, one at a time:
//!
//! ```text
//! for each source:  Fetching(i) ──▶ Persisting ──▶ Publishing ──▶ (request_delay)
//! ```
//!
//! A failure at any stage is recorded in the [`TickReport`] and the tick moves
//! on to the next source. Only cancellation ends a tick early.

use std::sync::Arc;
use std::time::Duration;

use blockwatch_core::bus::EventPublisher;
use blockwatch_core::metrics::Counters;
use blockwatch_core::store::SnapshotWriter;
use blockwatch_core::{InvalidationEvent, Snapshot, SourceDescriptor};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::SourceClient;

/// What the scheduler is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Fetching the source at this index of the enabled list.
    Fetching(usize),
    Persisting,
    Publishing,
}

/// Stage at which a source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Fetch,
    Persist,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub name: String,
    pub stage: FailureStage,
    pub message: String,
}

/// Result of one pass over the sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub persisted: usize,
    pub published: usize,
    pub failures: Vec<SourceFailure>,
    /// The tick stopped early because the token was cancelled.
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub request_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
            request_delay: Duration::from_millis(1000),
        }
    }
}

/// Drives fetch, persist and publish for every enabled source.
pub struct Scheduler {
    client: SourceClient,
    sources: Vec<SourceDescriptor>,
    writer: Arc<dyn SnapshotWriter>,
    publisher: Arc<dyn EventPublisher>,
    counters: Arc<Counters>,
    config: SchedulerConfig,
    phase: Mutex<Phase>,
}

impl Scheduler {
    /// Disabled descriptors in `sources` are dropped here.
    pub fn new(
        client: SourceClient,
        sources: Vec<SourceDescriptor>,
        writer: Arc<dyn SnapshotWriter>,
        publisher: Arc<dyn EventPublisher>,
        counters: Arc<Counters>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            client,
            sources: sources.into_iter().filter(|s| s.enabled).collect(),
            writer,
            publisher,
            counters,
            config,
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Run ticks every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Ingestion disabled, scheduler not started");
            return;
        }

        info!(
            sources = self.sources.len(),
            interval_secs = self.config.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let report = self.tick(&cancel).await;
            if report.cancelled {
                break;
            }

            info!(
                fetched = report.fetched,
                persisted = report.persisted,
                published = report.published,
                failures = report.failures.len(),
                "Tick complete"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        self.set_phase(Phase::Idle);
        info!("Scheduler stopped");
    }

    /// A single tick, honouring the enabled flag the same way [`Self::run`] does.
    /// Returns `None` when ingestion is disabled.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Option<TickReport> {
        if !self.config.enabled {
            info!("Ingestion disabled, skipping tick");
            return None;
        }
        Some(self.tick(cancel).await)
    }

    /// One sequential pass over the enabled sources.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        for (index, source) in self.sources.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.request_delay) => {}
                }
            }

            self.set_phase(Phase::Fetching(index));
            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                result = self.client.fetch(source) => result,
            };

            let snapshot = match fetched {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    report.failures.push(SourceFailure {
                        name: source.name.clone(),
                        stage: FailureStage::Fetch,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            report.fetched += 1;

            self.set_phase(Phase::Persisting);
            let name = snapshot.name.clone();
            if let Err(e) = self.persist(snapshot) {
                self.counters.persist_failed();
                error!(source = %name, error = %e, "Failed to persist snapshot");
                report.failures.push(SourceFailure {
                    name,
                    stage: FailureStage::Persist,
                    message: e.to_string(),
                });
                continue;
            }
            report.persisted += 1;

            self.set_phase(Phase::Publishing);
            let event = InvalidationEvent::new(name.as_str());
            let published = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(source = %name, "Publish abandoned on shutdown");
                    report.cancelled = true;
                    break;
                }
                result = self.publisher.publish(&event) => result,
            };
            match published {
                Ok(()) => {
                    self.counters.event_published();
                    report.published += 1;
                    debug!(source = %name, "Published invalidation event");
                }
                Err(e) => {
                    self.counters.publish_failed();
                    warn!(source = %name, error = %e, "Failed to publish invalidation event");
                    report.failures.push(SourceFailure {
                        name,
                        stage: FailureStage::Publish,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.set_phase(Phase::Idle);
        report
    }

    fn persist(&self, snapshot: Snapshot) -> blockwatch_core::Result<()> {
        self.writer.add_snapshot(snapshot)?;
        let written = self.writer.commit()?;
        self.counters.snapshots_persisted(written as u64);
        Ok(())
    }
}
