//! Sink client seam.
//!
//! The Sink is the downstream email-marketing platform. Each site maps to
//! its own Sink list, reached through one client per site held in a
//! [`SinkRegistry`] that is built once at startup and owned by the
//! processor — there is no ambient client cache.
//!
//! Every failure a client reports is classified into exactly one of
//! transient / rate-limited / fatal; "subscriber not found" is not a
//! failure (absent on fetch, success on delete). The engine owns all retry
//! decisions; clients only perform calls and classify.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ErrorClass, SubscriberRecord};

pub use http::{build_registry, HttpSinkClient};

/// Classified Sink failure.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Network error, timeout or 5xx — retried with backoff.
    #[error("transient sink error: {0}")]
    Transient(String),

    /// Sink rate limit — retried like a transient failure, recorded
    /// distinctly for forensics.
    #[error("sink rate limited: {0}")]
    RateLimited(String),

    /// Permanently invalid target — dead-lettered on first occurrence.
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::RateLimited(_) => ErrorClass::RateLimited,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Per-site Sink operations.
#[async_trait]
pub trait SinkApi: Send + Sync {
    /// Read the current record for an email; `None` when absent.
    async fn fetch(&self, email: &str) -> Result<Option<SubscriberRecord>, SinkError>;

    /// Create-or-update the record, keyed by email.
    async fn upsert(&self, record: &SubscriberRecord) -> Result<(), SinkError>;

    /// Remove the subscriber from the list. Absence is success.
    async fn delete(&self, email: &str) -> Result<(), SinkError>;
}

/// Site id -> Sink client, constructed once and passed by reference.
#[derive(Default)]
pub struct SinkRegistry {
    clients: HashMap<String, Arc<dyn SinkApi>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, site_id: impl Into<String>, client: Arc<dyn SinkApi>) {
        self.clients.insert(site_id.into(), client);
    }

    pub fn get(&self, site_id: &str) -> Option<&Arc<dyn SinkApi>> {
        self.clients.get(site_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
