//! Blockwatch Serve - HTTP read API with event-driven cache invalidation.
//!
//! Starts the API server and, alongside it, a consumer task that drains this
//! instance's invalidation queue into the cache.

use std::sync::Arc;

use axum::http::Request;
use blockwatch_core::bus::{AmqpSubscriber, EventConsumer};
use blockwatch_core::metrics::{Counters, init_metrics, start_metrics_server};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use blockwatch_serve::{AppState, Config, InvalidationHandler, router};

/// Blockwatch API server.
#[derive(Parser, Debug)]
#[command(name = "blockwatch-serve")]
#[command(about = "HTTP API for blockchain snapshots", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let amqp = config.amqp.clone();

    if config.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(config.metrics_port, handle).await?;
    }

    // Create application state
    let counters = Arc::new(Counters::default());
    let state = AppState::new(config, counters.clone())?;

    // Invalidation consumer
    let cancel = CancellationToken::new();
    let consumer_task = {
        let consumer = EventConsumer::new(
            InvalidationHandler::new(state.queries.clone(), counters.clone()),
            counters,
        );
        let subscriber = AmqpSubscriber::new(amqp);
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&subscriber, cancel).await })
    };

    // Build router with middleware
    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    query = request.uri().query().unwrap_or("")
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, stopping gracefully...");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    consumer_task.await?;

    Ok(())
}
