//! Redis-backed durable queue.
//!
//! Key layout (all under the `membersync:` prefix):
//! - `{site}:ready` — list, FIFO of due items for one site
//! - `{site}:processing` — list, items currently held by a worker
//! - `delayed` — sorted set of items scored by `next_attempt_at` (ms)
//! - `inflight` — set of idempotency keys with pending work
//! - `last` — hash, member key -> last completed idempotency key
//! - `dlq` — sorted set of dead-letter entries scored by `moved_at` (ms)
//!
//! Dequeue uses the reliable-queue pattern: `LMOVE` ready -> processing, ack
//! removes the processing entry. `recover()` moves stranded processing
//! entries back to ready after a crash, so attempt counters survive without
//! data loss. Delivery stays at-least-once; the idempotent upsert downstream
//! makes redelivery safe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};
use tracing::{info, warn};

use super::{DurableQueue, EnqueueOutcome, QueueError};
use crate::model::{AttemptRecord, DeadLetterEntry, WorkItem};

const KEY_PREFIX: &str = "membersync";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn backend_err(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Redis-backed `DurableQueue` implementation.
pub struct RedisQueue {
    conn: ConnectionManager,
    sites: Vec<String>,
    rr: AtomicUsize,
}

impl RedisQueue {
    /// Connect to Redis. `sites` fixes the partitions this instance serves;
    /// routing guarantees no other partition receives work.
    pub async fn connect(url: &str, sites: Vec<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        info!(sites = sites.len(), "queue_connected");
        Ok(Self {
            conn,
            sites,
            rr: AtomicUsize::new(0),
        })
    }

    /// Move items stranded in processing lists back to the front of their
    /// ready lists. Call once on startup, before workers pull.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0usize;
        for site in &self.sites {
            loop {
                let moved: Option<String> = conn
                    .lmove(
                        processing_key(site),
                        ready_key(site),
                        Direction::Right,
                        Direction::Left,
                    )
                    .await
                    .map_err(backend_err)?;
                match moved {
                    Some(_) => recovered += 1,
                    None => break,
                }
            }
        }
        Ok(recovered)
    }

    /// Promote delayed items whose schedule has arrived into their site's
    /// ready list. Promotion is not transactional; a crash mid-promotion can
    /// redeliver an item, which at-least-once semantics already permit.
    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(delayed_key(), 0i64, now_ms)
            .await
            .map_err(backend_err)?;

        for raw in due {
            let item: WorkItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "queue_delayed_entry_unparseable");
                    let _: i64 = conn.zrem(delayed_key(), &raw).await.map_err(backend_err)?;
                    continue;
                }
            };
            let _: i64 = conn
                .rpush(ready_key(&item.event.site_id), &raw)
                .await
                .map_err(backend_err)?;
            let _: i64 = conn.zrem(delayed_key(), &raw).await.map_err(backend_err)?;
        }
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<WorkItem>, QueueError> {
        let mut conn = self.conn.clone();
        let n = self.sites.len();
        if n == 0 {
            return Ok(None);
        }
        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let site = &self.sites[(start + i) % n];
            let raw: Option<String> = conn
                .lmove(
                    ready_key(site),
                    processing_key(site),
                    Direction::Left,
                    Direction::Right,
                )
                .await
                .map_err(backend_err)?;
            if let Some(raw) = raw {
                let item: WorkItem = serde_json::from_str(&raw)?;
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Remove an item's processing entry. Serialization of these types is
    /// deterministic, so re-serializing the dequeued item reproduces the
    /// stored bytes.
    async fn release_processing(&self, item: &WorkItem) -> Result<(), QueueError> {
        let raw = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lrem(processing_key(&item.event.site_id), 1, &raw)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

fn ready_key(site_id: &str) -> String {
    format!("{KEY_PREFIX}:{site_id}:ready")
}

fn processing_key(site_id: &str) -> String {
    format!("{KEY_PREFIX}:{site_id}:processing")
}

fn delayed_key() -> String {
    format!("{KEY_PREFIX}:delayed")
}

fn inflight_key() -> String {
    format!("{KEY_PREFIX}:inflight")
}

fn last_completed_key() -> String {
    format!("{KEY_PREFIX}:last")
}

fn dlq_key() -> String {
    format!("{KEY_PREFIX}:dlq")
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.conn.clone();

        let inflight: bool = conn
            .sismember(inflight_key(), &item.idempotency_key)
            .await
            .map_err(backend_err)?;
        if inflight {
            return Ok(EnqueueOutcome::Coalesced);
        }

        let last: Option<String> = conn
            .hget(last_completed_key(), item.member_key())
            .await
            .map_err(backend_err)?;
        if last.as_deref() == Some(item.idempotency_key.as_str()) {
            return Ok(EnqueueOutcome::Coalesced);
        }

        let _: i64 = conn
            .sadd(inflight_key(), &item.idempotency_key)
            .await
            .map_err(backend_err)?;

        let raw = serde_json::to_string(&item)?;
        if item.next_attempt_at > Utc::now() {
            let _: i64 = conn
                .zadd(delayed_key(), &raw, item.next_attempt_at.timestamp_millis())
                .await
                .map_err(backend_err)?;
        } else {
            let _: i64 = conn
                .rpush(ready_key(&item.event.site_id), &raw)
                .await
                .map_err(backend_err)?;
        }

        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<WorkItem>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.promote_due().await?;
            if let Some(item) = self.try_dequeue().await? {
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
        self.release_processing(item).await?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(inflight_key(), &item.idempotency_key)
            .await
            .map_err(backend_err)?;
        let _: i64 = conn
            .hset(last_completed_key(), item.member_key(), &item.idempotency_key)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn reschedule(
        &self,
        item: &WorkItem,
        next_attempt_at: DateTime<Utc>,
        attempt: Option<AttemptRecord>,
    ) -> Result<(), QueueError> {
        self.release_processing(item).await?;

        let mut updated = item.clone();
        if let Some(attempt) = attempt {
            updated.attempt_count += 1;
            updated.attempt_history.push(attempt);
        }
        updated.next_attempt_at = next_attempt_at;

        let raw = serde_json::to_string(&updated)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(delayed_key(), &raw, next_attempt_at.timestamp_millis())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        item: &WorkItem,
        entry: DeadLetterEntry,
    ) -> Result<(), QueueError> {
        self.release_processing(item).await?;

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(inflight_key(), &item.idempotency_key)
            .await
            .map_err(backend_err)?;
        let raw = serde_json::to_string(&entry)?;
        let _: i64 = conn
            .zadd(dlq_key(), &raw, entry.moved_at.timestamp_millis())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .zrangebyscore(dlq_key(), from.timestamp_millis(), to.timestamp_millis())
            .await
            .map_err(backend_err)?;

        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "queue_dlq_entry_unparseable"),
            }
        }
        Ok(entries)
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> Result<WorkItem, QueueError> {
        let raw = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(dlq_key(), &raw).await.map_err(backend_err)?;
        if removed == 0 {
            return Err(QueueError::backend("dead letter entry not found"));
        }

        let item = WorkItem::new(entry.event.clone());
        self.enqueue(item.clone()).await?;
        info!(
            site_id = %item.event.site_id,
            idempotency_key = %item.idempotency_key,
            "dead_letter_replayed"
        );
        Ok(item)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut total: usize = 0;
        for site in &self.sites {
            let len: usize = conn.llen(ready_key(site)).await.map_err(backend_err)?;
            total += len;
        }
        let delayed: usize = conn.zcard(delayed_key()).await.map_err(backend_err)?;
        Ok(total + delayed)
    }

    async fn dead_letter_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(dlq_key()).await.map_err(backend_err)?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
