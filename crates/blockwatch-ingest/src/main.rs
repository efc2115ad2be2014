//! Blockwatch ingestion daemon.
//!
//! Periodically fetches a snapshot from every configured source, appends it
//! to the SQLite history, and publishes an invalidation event so readers drop
//! their cached view of that source.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: five BlockCypher sources every 10 minutes
//! blockwatch-ingest
//!
//! # Custom env file
//! blockwatch-ingest --dotenv /etc/blockwatch/ingest.env
//! ```
//!
//! # Graceful Shutdown
//!
//! Ctrl+C cancels the scheduler. An in-flight fetch or sleep is abandoned;
//! snapshots already committed stay committed.

use std::sync::Arc;

use anyhow::Context;
use blockwatch_core::bus::AmqpPublisher;
use blockwatch_core::metrics::{Counters, init_metrics, start_metrics_server};
use blockwatch_core::store::SqliteStore;
use blockwatch_ingest::{HttpTransport, IngestConfig, Scheduler, SchedulerConfig, SourceClient};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Blockwatch ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "blockwatch-ingest")]
#[command(about = "Scheduled blockchain snapshot ingestion", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Blockwatch ingestion daemon starting...");

    let config = IngestConfig::from_env()?;

    if config.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(config.metrics_port, handle).await?;
    }

    let counters = Arc::new(Counters::default());

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );

    let publisher = Arc::new(AmqpPublisher::new(config.amqp.clone()));

    let transport = Arc::new(HttpTransport::new(config.upstream_timeout)?);
    let client = SourceClient::new(transport, config.retry, counters.clone());

    let scheduler = Scheduler::new(
        client,
        config.sources.clone(),
        store,
        publisher,
        counters.clone(),
        SchedulerConfig {
            enabled: config.enabled,
            interval: config.interval,
            request_delay: config.request_delay,
        },
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, stopping gracefully...");
            }
            cancel.cancel();
        });
    }

    if args.once {
        if let Some(report) = scheduler.run_once(&cancel).await {
            tracing::info!(
                fetched = report.fetched,
                persisted = report.persisted,
                published = report.published,
                failures = report.failures.len(),
                "Single tick complete"
            );
            for failure in &report.failures {
                tracing::warn!(
                    source = %failure.name,
                    stage = ?failure.stage,
                    "{}",
                    failure.message
                );
            }
        }
    } else {
        scheduler.run(cancel).await;
    }

    let totals = counters.snapshot();
    tracing::info!(
        fetched = totals.snapshots_fetched,
        persisted = totals.snapshots_persisted,
        published = totals.events_published,
        "Ingestion daemon stopped"
    );

    Ok(())
}
