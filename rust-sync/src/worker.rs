//! Worker pool pulling from the durable queue.
//!
//! `run` spawns a fixed number of worker tasks, each looping: dequeue →
//! defer not-yet-due items → hand the item to the processor. Workers share
//! the queue, breaker, metrics and Sink registry; same-member serialization
//! comes from the processor's ordering guard, not from locks. The pool
//! drains gracefully on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::processor::Processor;
use crate::queue::DurableQueue;

/// How long one dequeue call blocks before the loop re-checks shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Run the worker pool until a shutdown signal arrives.
pub async fn run(
    queue: Arc<dyn DurableQueue>,
    processor: Arc<Processor>,
    concurrency: usize,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        let queue = Arc::clone(&queue);
        let processor = Arc::clone(&processor);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(worker_loop(
            worker_id, queue, processor, shutdown,
        )));
    }

    info!(concurrency = concurrency, "worker_pool_ready");

    shutdown_signal().await;
    info!("worker_pool_stopping");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker_join_failed");
        }
    }

    info!("worker_pool_shutdown_complete");
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn DurableQueue>,
    processor: Arc<Processor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let pulled = tokio::select! {
            _ = shutdown.changed() => break,
            pulled = queue.dequeue(DEQUEUE_WAIT) => pulled,
        };

        match pulled {
            Ok(Some(item)) => {
                // Pulled ahead of schedule: defer, don't process early
                if item.next_attempt_at > Utc::now() {
                    let next_attempt_at = item.next_attempt_at;
                    if let Err(e) = queue.reschedule(&item, next_attempt_at, None).await {
                        error!(worker_id = worker_id, error = %e, "queue_defer_failed");
                    }
                    continue;
                }

                processor.process_item(queue.as_ref(), item).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker_id = worker_id, error = %e, "queue_dequeue_failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    info!(worker_id = worker_id, "worker_stopped");
}

/// Create a future that completes when a shutdown signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
