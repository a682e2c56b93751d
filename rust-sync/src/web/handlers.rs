//! Webhook and observability endpoint handlers.
//!
//! The webhook handler is designed to be fast - it only:
//! 1. Routes to the site context
//! 2. Verifies the signature
//! 3. Normalizes and enqueues the event
//! 4. Returns immediately
//!
//! The Sink is never contacted on the request path; delivery happens in the
//! background workers. Delivery-side failures are invisible here and only
//! observable through `/health`, `/metrics` and the dead-letter listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::SyncError;
use crate::metrics::{Counter, Metrics, MetricsSnapshot};
use crate::model::{EventType, WorkItem};
use crate::normalize::normalize;
use crate::queue::{DurableQueue, EnqueueOutcome};
use crate::signature;
use crate::util::hash_email;

/// Header carrying the hex HMAC digest.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Header carrying the signing timestamp (unix epoch seconds).
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<dyn DurableQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
}

// =============================================================================
// Webhook intake
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookParams {
    #[serde(default)]
    pub event: Option<String>,
}

/// Webhook response.
#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Map an intake error to its response. Callers only ever see accept or
/// reject here; delivery-side failures never surface on this path.
fn rejection(site_id: &str, err: SyncError) -> (StatusCode, Json<WebhookResponse>) {
    let (status_code, status) = match &err {
        SyncError::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        SyncError::UnknownSite(_) => (StatusCode::NOT_FOUND, "unknown_site"),
        SyncError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
        SyncError::Queue(_) | SyncError::Sink(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "queue_error")
        }
    };

    if status_code.is_server_error() {
        error!(site_id = %site_id, error = %err, "webhook_rejected");
    } else {
        warn!(site_id = %site_id, error = %err, "webhook_rejected");
    }

    (
        status_code,
        Json(WebhookResponse {
            status,
            event_id: None,
            detail: Some(err.to_string()),
        }),
    )
}

/// Source webhook endpoint: `POST /webhook/source/{site_id}?event=...`.
///
/// 404 unknown site, 401 signature failure, 400 malformed payload or event
/// vocabulary, 500 queue write failure, 200 on enqueue.
pub async fn source_webhook(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Query(params): Query<WebhookParams>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let Some(site) = state.config.site(&site_id) else {
        return rejection(&site_id, SyncError::unknown_site(site_id.clone()));
    };

    // Fail closed before touching the payload
    let provided_signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let provided_timestamp = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok());
    if !signature::verify(
        &site.webhook_secret,
        &body,
        provided_signature,
        provided_timestamp,
        state.config.signature_max_age,
    ) {
        return rejection(&site_id, SyncError::auth("invalid webhook signature"));
    }

    let Some(event_type) = params.event.as_deref().and_then(EventType::parse) else {
        return rejection(
            &site_id,
            SyncError::validation(format!("unknown event type: {:?}", params.event)),
        );
    };

    let event = match normalize(&site_id, event_type, &body) {
        Ok(event) => event,
        Err(e) => return rejection(&site_id, e),
    };

    let email_hash = hash_email(&event.email);
    let item = WorkItem::new(event);
    let event_id = item.event_id.to_string();

    match state.queue.enqueue(item).await {
        Ok(outcome) => {
            match outcome {
                EnqueueOutcome::Queued => {
                    state.metrics.incr(&site_id, Counter::Enqueued);
                    info!(
                        site_id = %site_id,
                        event_type = %event_type,
                        email_hash = %email_hash,
                        event_id = %event_id,
                        "event_enqueued"
                    );
                }
                EnqueueOutcome::Coalesced => {
                    state.metrics.incr(&site_id, Counter::Coalesced);
                    info!(
                        site_id = %site_id,
                        event_type = %event_type,
                        email_hash = %email_hash,
                        "event_coalesced"
                    );
                }
            }
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "enqueued",
                    event_id: Some(event_id),
                    detail: None,
                }),
            )
        }
        Err(e) => rejection(&site_id, SyncError::from(e)),
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub queue: QueueHealth,
    pub breakers: BTreeMap<String, BreakerHealth>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct BreakerHealth {
    pub state: &'static str,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

/// Health check endpoint: queue reachability plus per-site breaker state.
/// Read-only, no side effects.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue = match state.queue.ping().await {
        Ok(()) => QueueHealth {
            status: "healthy",
            depth: state.queue.depth().await.ok(),
            dead_letters: state.queue.dead_letter_depth().await.ok(),
            error: None,
        },
        Err(e) => QueueHealth {
            status: "unhealthy",
            depth: None,
            dead_letters: None,
            error: Some(e.to_string()),
        },
    };

    let mut breakers = BTreeMap::new();
    for site in &state.config.sites {
        let breaker_state = state.breaker.state(&site.site_id);
        breakers.insert(
            site.site_id.clone(),
            BreakerHealth {
                state: if breaker_state.is_open() {
                    "open"
                } else {
                    "closed"
                },
                consecutive_failures: breaker_state.consecutive_failures,
                opened_at: breaker_state.opened_at,
            },
        );
    }

    let healthy = queue.status == "healthy";
    (
        if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" },
            timestamp: Utc::now(),
            queue,
            breakers,
        }),
    )
}

// =============================================================================
// Metrics
// =============================================================================

/// Metrics endpoint: per-site counters, queue depths, uptime.
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.metrics.snapshot();
    snapshot.queue_depth = state.queue.depth().await.ok();
    snapshot.dead_letter_depth = state.queue.dead_letter_depth().await.ok();
    Json(snapshot)
}
