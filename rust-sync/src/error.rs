//! Error taxonomy for the sync pipeline.
//!
//! Intake-side failures (`Auth`, `Validation`, `UnknownSite`) are rejected at
//! the webhook boundary and never reach the queue. Delivery-side failures are
//! carried by `SinkError` (classified transient / rate-limited / fatal) and
//! `QueueError`, and surface only through retries, the breaker and the
//! dead-letter store.

use thiserror::Error;

use crate::queue::QueueError;
use crate::sink::SinkError;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad or missing webhook signature. Rejected, never queued.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed payload or unknown event vocabulary. Rejected, never queued.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// The inbound route named a site that is not configured.
    #[error("unknown site: {0}")]
    UnknownSite(String),

    /// Durable queue backend failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Classified Sink failure.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl SyncError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_site(site_id: impl Into<String>) -> Self {
        Self::UnknownSite(site_id.into())
    }
}
