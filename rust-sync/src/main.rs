//! MemberSync service binary.
//!
//! Runs the webhook intake server and the delivery worker pool in one
//! process, sharing the queue, circuit breaker and metrics so `/health`
//! reports the real delivery state. Multiple instances can run against the
//! same Redis; the queue coordinates them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use membersync::sink::build_registry;
use membersync::{
    web, worker, AppState, CircuitBreaker, Config, DurableQueue, Metrics, Processor, RedisQueue,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("service_starting");

    // Load configuration from environment
    let config = Arc::new(Config::from_env()?);
    info!(
        sites = config.sites.len(),
        port = config.port,
        concurrency = config.worker_concurrency,
        breaker_threshold = config.breaker.failure_threshold,
        "config_loaded"
    );

    // Durable queue, recovering work stranded by a previous crash
    let queue = RedisQueue::connect(&config.redis_url, config.site_ids())
        .await
        .context("Failed to connect to Redis")?;
    let recovered = queue
        .recover()
        .await
        .context("Failed to recover in-flight work")?;
    if recovered > 0 {
        info!(recovered = recovered, "queue_recovered_inflight_items");
    }
    let queue: Arc<dyn DurableQueue> = Arc::new(queue);

    // Shared delivery-side state
    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let metrics = Arc::new(Metrics::new(config.site_ids()));
    let sinks = build_registry(&config).context("Failed to build sink clients")?;
    let processor = Arc::new(Processor::new(
        sinks,
        Arc::clone(&breaker),
        config.retry.clone(),
        Arc::clone(&metrics),
    ));

    // Web server
    let state = AppState {
        config: Arc::clone(&config),
        queue: Arc::clone(&queue),
        breaker: Arc::clone(&breaker),
        metrics: Arc::clone(&metrics),
    };
    let app = web::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!(address = %addr, "web_server_listening");

    // Run server and workers side by side until shutdown
    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(worker::shutdown_signal())
            .await
            .context("Server error")
    };
    let workers = worker::run(
        Arc::clone(&queue),
        Arc::clone(&processor),
        config.worker_concurrency,
    );

    tokio::try_join!(server, workers)?;

    info!("service_shutdown_complete");
    Ok(())
}
