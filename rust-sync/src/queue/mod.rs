//! Durable work queue and dead-letter store.
//!
//! The queue guarantees at-least-once delivery to the processor with FIFO
//! ordering *within* a site partition; there is no cross-site ordering, so
//! one site's backoff never stalls another. Items carrying an idempotency
//! key that is already in flight — or that was the most recently completed
//! key for the same member — are coalesced on enqueue.
//!
//! Two backends implement the contract:
//! - [`MemoryQueue`]: in-process, used by tests and embedders
//! - [`RedisQueue`]: durable, survives restarts and worker crashes

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::model::{AttemptRecord, DeadLetterEntry, WorkItem};

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Queue backend failure.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// What happened to an enqueued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted as new work.
    Queued,
    /// Collapsed onto an identical in-flight or just-completed event.
    Coalesced,
}

/// At-least-once, FIFO-per-site work queue with delayed redelivery and an
/// attached dead-letter store.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Add an item. Items scheduled in the future land in the delayed set.
    async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, QueueError>;

    /// Pull the next due item, waiting up to `wait`. Returns `None` on
    /// timeout so callers can observe shutdown between pulls.
    async fn dequeue(&self, wait: Duration) -> Result<Option<WorkItem>, QueueError>;

    /// Complete an item: releases its in-flight key and records it as the
    /// member's most recently completed event for dedup.
    async fn ack(&self, item: &WorkItem) -> Result<(), QueueError>;

    /// Return an item to the delayed set for a later attempt. When
    /// `attempt` is given the item's attempt count and history are updated;
    /// breaker deferrals pass `None` so no retry budget is burned.
    async fn reschedule(
        &self,
        item: &WorkItem,
        next_attempt_at: DateTime<Utc>,
        attempt: Option<AttemptRecord>,
    ) -> Result<(), QueueError>;

    /// Transfer an item to the dead-letter store.
    async fn dead_letter(&self, item: &WorkItem, entry: DeadLetterEntry)
        -> Result<(), QueueError>;

    /// Dead-letter entries whose `moved_at` falls in `[from, to]`.
    async fn list_dead_letters(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Remove an entry from the dead-letter store and re-enqueue it as a
    /// fresh work item: attempt count reset, fresh `first_enqueued_at`,
    /// original event (including `source_updated_at`) preserved so the
    /// ordering guard still applies.
    async fn replay(&self, entry: &DeadLetterEntry) -> Result<WorkItem, QueueError>;

    /// Items waiting or scheduled (ready + delayed).
    async fn depth(&self) -> Result<usize, QueueError>;

    /// Entries currently dead-lettered.
    async fn dead_letter_depth(&self) -> Result<usize, QueueError>;

    /// Backend reachability probe for `/health`.
    async fn ping(&self) -> Result<(), QueueError>;
}
