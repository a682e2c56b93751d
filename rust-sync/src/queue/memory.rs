//! In-process queue backend.
//!
//! Mirrors the durable backend's semantics (per-site FIFO, delayed
//! redelivery, idempotency-key dedup, dead-letter store) behind a single
//! mutex, without persistence. Used by the test suite and by embedders
//! that drive the processor without external infrastructure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DurableQueue, EnqueueOutcome, QueueError};
use crate::model::{AttemptRecord, DeadLetterEntry, WorkItem};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Inner {
    ready: HashMap<String, VecDeque<WorkItem>>,
    /// Sites in first-seen order; round-robin fairness cursor below.
    site_order: Vec<String>,
    rr: usize,
    delayed: Vec<WorkItem>,
    inflight: HashSet<String>,
    /// member key -> idempotency key of the last completed event.
    last_completed: HashMap<String, String>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// In-memory `DurableQueue` implementation.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_dequeue(&self) -> Option<WorkItem> {
        let mut inner = self.lock();
        promote_due(&mut inner);

        let n = inner.site_order.len();
        if n == 0 {
            return None;
        }
        let start = inner.rr;
        for i in 0..n {
            let idx = (start + i) % n;
            let site = inner.site_order[idx].clone();
            if let Some(queue) = inner.ready.get_mut(&site) {
                if let Some(item) = queue.pop_front() {
                    inner.rr = (idx + 1) % n;
                    return Some(item);
                }
            }
        }
        None
    }
}

fn ensure_site(inner: &mut Inner, site_id: &str) {
    if !inner.site_order.iter().any(|s| s == site_id) {
        inner.site_order.push(site_id.to_string());
    }
    inner.ready.entry(site_id.to_string()).or_default();
}

/// Move delayed items whose time has come into their site's ready queue,
/// oldest schedule first so per-site FIFO holds across retries.
fn promote_due(inner: &mut Inner) {
    let now = Utc::now();
    if inner.delayed.iter().all(|i| i.next_attempt_at > now) {
        return;
    }

    let delayed = std::mem::take(&mut inner.delayed);
    let (mut due, later): (Vec<_>, Vec<_>) = delayed
        .into_iter()
        .partition(|i| i.next_attempt_at <= now);
    inner.delayed = later;

    due.sort_by_key(|i| i.next_attempt_at);
    for item in due {
        let site = item.event.site_id.clone();
        ensure_site(inner, &site);
        if let Some(queue) = inner.ready.get_mut(&site) {
            queue.push_back(item);
        }
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.lock();

        if inner.inflight.contains(&item.idempotency_key) {
            return Ok(EnqueueOutcome::Coalesced);
        }
        if inner.last_completed.get(&item.member_key()) == Some(&item.idempotency_key) {
            return Ok(EnqueueOutcome::Coalesced);
        }

        inner.inflight.insert(item.idempotency_key.clone());
        let site = item.event.site_id.clone();
        ensure_site(&mut inner, &site);

        if item.next_attempt_at > Utc::now() {
            inner.delayed.push(item);
        } else if let Some(queue) = inner.ready.get_mut(&site) {
            queue.push_back(item);
        }

        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<WorkItem>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(item) = self.try_dequeue() {
                return Ok(Some(item));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, item: &WorkItem) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.inflight.remove(&item.idempotency_key);
        inner
            .last_completed
            .insert(item.member_key(), item.idempotency_key.clone());
        Ok(())
    }

    async fn reschedule(
        &self,
        item: &WorkItem,
        next_attempt_at: DateTime<Utc>,
        attempt: Option<AttemptRecord>,
    ) -> Result<(), QueueError> {
        let mut updated = item.clone();
        if let Some(attempt) = attempt {
            updated.attempt_count += 1;
            updated.attempt_history.push(attempt);
        }
        updated.next_attempt_at = next_attempt_at;

        // The idempotency key stays in flight while the item waits.
        self.lock().delayed.push(updated);
        Ok(())
    }

    async fn dead_letter(
        &self,
        item: &WorkItem,
        entry: DeadLetterEntry,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.inflight.remove(&item.idempotency_key);
        inner.dead_letters.push(entry);
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let inner = self.lock();
        let mut entries: Vec<DeadLetterEntry> = inner
            .dead_letters
            .iter()
            .filter(|e| e.moved_at >= from && e.moved_at <= to)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.moved_at);
        Ok(entries)
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> Result<WorkItem, QueueError> {
        {
            let mut inner = self.lock();
            let position = inner
                .dead_letters
                .iter()
                .position(|e| e == entry)
                .ok_or_else(|| QueueError::backend("dead letter entry not found"))?;
            inner.dead_letters.remove(position);
        }

        let item = WorkItem::new(entry.event.clone());
        self.enqueue(item.clone()).await?;
        Ok(item)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let inner = self.lock();
        let ready: usize = inner.ready.values().map(VecDeque::len).sum();
        Ok(ready + inner.delayed.len())
    }

    async fn dead_letter_depth(&self) -> Result<usize, QueueError> {
        Ok(self.lock().dead_letters.len())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
