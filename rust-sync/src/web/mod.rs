//! Web server module for webhook intake and observability.
//!
//! This module provides a thin, fast intake layer:
//! - Receives Source webhooks, verifies signatures, enqueues immediately
//! - Exposes `/health` (queue reachability + per-site breaker state)
//! - Exposes `/metrics` (per-site event counters)
//!
//! All Sink interaction happens in the background workers.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, metrics, source_webhook, AppState, HealthResponse, WebhookResponse,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/source/:site_id", post(source_webhook))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
