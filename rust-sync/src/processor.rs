//! Event processor — the delivery-side orchestrator.
//!
//! Each work item moves through: breaker gate → fetch current Sink state →
//! merge (status-change detection + ordering guard) → apply (idempotent
//! upsert or delete) → outcome routing (ack / retry / dead-letter).
//!
//! The ordering guard is what serializes same-member processing without
//! locks: an event older than the record already applied is a no-op, so
//! out-of-order retries and replays cannot clobber fresher state.
//!
//! `process_event` is also the resync entry point: batch tooling drives it
//! directly with synthesized events, outside the queue.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info};

use crate::breaker::{BreakerTransition, CircuitBreaker};
use crate::metrics::{Counter, Metrics};
use crate::model::{
    AttemptRecord, Completion, CompletionOutcome, EventType, MemberEvent, SubscriberRecord,
    WorkItem,
};
use crate::queue::DurableQueue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{SinkError, SinkRegistry};
use crate::util::hash_email;

/// Result of applying one event against the Sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The Sink mutation was performed (or was an idempotent no-op delete).
    Applied,
    /// The event was older than the applied record; nothing was written.
    SkippedStale,
}

/// Delivery-side orchestrator shared by all worker tasks.
pub struct Processor {
    sinks: SinkRegistry,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Processor {
    pub fn new(
        sinks: SinkRegistry,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sinks,
            breaker,
            retry,
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Apply a single event against the Sink: fetch, merge, apply.
    ///
    /// Does not touch the queue or the breaker; `process_item` wraps this
    /// with failure routing. Public so resync tooling can drive events
    /// synchronously.
    pub async fn process_event(
        &self,
        event: &MemberEvent,
    ) -> Result<ProcessOutcome, SinkError> {
        let sink = self.sinks.get(&event.site_id).ok_or_else(|| {
            SinkError::Fatal(format!("no sink client for site {}", event.site_id))
        })?;

        let existing = sink.fetch(&event.email).await?;

        // Ordering guard: never let an older event overwrite fresher state.
        if let Some(record) = &existing {
            if let Some(last_updated) = record.last_updated {
                if last_updated > event.source_updated_at {
                    info!(
                        site_id = %event.site_id,
                        email_hash = %hash_email(&event.email),
                        applied_at = %last_updated,
                        event_at = %event.source_updated_at,
                        "stale_event_skipped"
                    );
                    return Ok(ProcessOutcome::SkippedStale);
                }
            }
        }

        match event.event_type {
            EventType::Deleted => {
                sink.delete(&event.email).await?;
            }
            EventType::Added | EventType::Updated => {
                let record = merge_record(event, existing.as_ref());
                sink.upsert(&record).await?;
            }
        }

        Ok(ProcessOutcome::Applied)
    }

    /// Run one dequeued item through the full state machine and route the
    /// outcome. Emits exactly one completion record.
    pub async fn process_item(&self, queue: &dyn DurableQueue, item: WorkItem) -> Completion {
        let started = Instant::now();
        let site_id = item.event.site_id.clone();

        // Breaker gate: a known-down Sink is not contacted, and the deferral
        // burns no retry budget.
        if !self.breaker.allow(&site_id) {
            let resume_at = Utc::now()
                + chrono::Duration::seconds(self.breaker.cooldown().as_secs() as i64);
            if let Err(e) = queue.reschedule(&item, resume_at, None).await {
                error!(site_id = %site_id, error = %e, "queue_reschedule_failed");
            }
            self.metrics.incr(&site_id, Counter::Deferred);
            let completion = Completion::new(&item, CompletionOutcome::Deferred, elapsed(started))
                .with_detail("circuit breaker open");
            completion.emit();
            return completion;
        }

        match self.process_event(&item.event).await {
            Ok(outcome) => {
                if let Err(e) = queue.ack(&item).await {
                    error!(site_id = %site_id, error = %e, "queue_ack_failed");
                }
                if self.breaker.record_success(&site_id) == BreakerTransition::Closed {
                    self.metrics.incr(&site_id, Counter::BreakerClosed);
                }

                let completion_outcome = match outcome {
                    ProcessOutcome::Applied => CompletionOutcome::Succeeded,
                    ProcessOutcome::SkippedStale => {
                        self.metrics.incr(&site_id, Counter::StaleSkipped);
                        CompletionOutcome::SkippedStale
                    }
                };
                self.metrics.incr(&site_id, Counter::Succeeded);

                let completion = Completion::new(&item, completion_outcome, elapsed(started));
                completion.emit();
                completion
            }
            Err(sink_error) if sink_error.is_fatal() => {
                // Fatal outcomes never consume retry budget or breaker state.
                let attempt = AttemptRecord {
                    at: Utc::now(),
                    error_class: sink_error.class(),
                    message: sink_error.to_string(),
                };
                let entry = item.to_dead_letter(sink_error.to_string(), Some(attempt));
                if let Err(e) = queue.dead_letter(&item, entry).await {
                    error!(site_id = %site_id, error = %e, "queue_dead_letter_failed");
                }
                self.metrics.incr(&site_id, Counter::DeadLettered);

                let mut completion =
                    Completion::new(&item, CompletionOutcome::DeadLettered, elapsed(started))
                        .with_detail(sink_error.to_string());
                completion.attempt_count = item.attempt_count + 1;
                completion.emit();
                completion
            }
            Err(sink_error) => {
                if self.breaker.record_failure(&site_id) == BreakerTransition::Opened {
                    self.metrics.incr(&site_id, Counter::BreakerOpened);
                }

                let attempt = AttemptRecord {
                    at: Utc::now(),
                    error_class: sink_error.class(),
                    message: sink_error.to_string(),
                };
                let attempts_including_this = item.attempt_count + 1;

                match self.retry.decide(
                    attempts_including_this,
                    item.first_enqueued_at,
                    Utc::now(),
                ) {
                    RetryDecision::Retry { at } => {
                        if let Err(e) = queue.reschedule(&item, at, Some(attempt)).await {
                            error!(site_id = %site_id, error = %e, "queue_reschedule_failed");
                        }
                        self.metrics.incr(&site_id, Counter::Retried);

                        let mut completion =
                            Completion::new(&item, CompletionOutcome::Retrying, elapsed(started))
                                .with_detail(sink_error.to_string());
                        completion.attempt_count = attempts_including_this;
                        completion.emit();
                        completion
                    }
                    RetryDecision::DeadLetter { reason } => {
                        let entry = item.to_dead_letter(reason.clone(), Some(attempt));
                        if let Err(e) = queue.dead_letter(&item, entry).await {
                            error!(site_id = %site_id, error = %e, "queue_dead_letter_failed");
                        }
                        self.metrics.incr(&site_id, Counter::DeadLettered);

                        let mut completion = Completion::new(
                            &item,
                            CompletionOutcome::DeadLettered,
                            elapsed(started),
                        )
                        .with_detail(reason);
                        completion.attempt_count = attempts_including_this;
                        completion.emit();
                        completion
                    }
                }
            }
        }
    }
}

fn elapsed(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Merge an incoming event with the Sink's current record.
///
/// Status-change bookkeeping:
/// - no prior record: `previous_status` empty, `status_changed_at` is the
///   event's own timestamp
/// - prior record with a different status: `previous_status` takes the prior
///   status, `status_changed_at` refreshes to now
/// - unchanged status: both carry forward untouched
pub fn merge_record(
    event: &MemberEvent,
    existing: Option<&SubscriberRecord>,
) -> SubscriberRecord {
    let (previous_status, status_changed_at) = match existing {
        None => (String::new(), Some(event.source_updated_at)),
        Some(prior) if prior.status != event.status.as_str() => {
            info!(
                site_id = %event.site_id,
                email_hash = %hash_email(&event.email),
                previous_status = %prior.status,
                new_status = %event.status,
                "status_change_detected"
            );
            (prior.status.clone(), Some(Utc::now()))
        }
        Some(prior) => (prior.previous_status.clone(), prior.status_changed_at),
    };

    let signup_date = event
        .signup_at
        .map(|t| t.format("%Y-%m-%d").to_string())
        .or_else(|| {
            existing
                .map(|r| r.signup_date.clone())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_default();

    SubscriberRecord {
        email: event.email.clone(),
        name: event.name.clone(),
        status: event.status.as_str().to_string(),
        signup_date,
        last_updated: Some(event.source_updated_at),
        status_changed_at,
        previous_status,
        labels: event.labels.join(","),
        email_enabled: event.email_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};

    use crate::breaker::BreakerConfig;
    use crate::model::MemberStatus;
    use crate::queue::{DurableQueue, MemoryQueue};
    use crate::sink::SinkApi;

    // =========================================================================
    // Mock sink
    // =========================================================================

    #[derive(Default)]
    struct MockSink {
        records: Mutex<HashMap<String, SubscriberRecord>>,
        apply_failures: Mutex<VecDeque<SinkError>>,
        fetch_calls: AtomicUsize,
        apply_calls: AtomicUsize,
    }

    impl MockSink {
        fn fail_applies_with(&self, errors: Vec<SinkError>) {
            self.apply_failures.lock().unwrap().extend(errors);
        }

        fn record(&self, email: &str) -> Option<SubscriberRecord> {
            self.records.lock().unwrap().get(email).cloned()
        }

        fn sink_calls(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst) + self.apply_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SinkApi for MockSink {
        async fn fetch(&self, email: &str) -> Result<Option<SubscriberRecord>, SinkError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.lock().unwrap().get(email).cloned())
        }

        async fn upsert(&self, record: &SubscriberRecord) -> Result<(), SinkError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.apply_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.records
                .lock()
                .unwrap()
                .insert(record.email.clone(), record.clone());
            Ok(())
        }

        async fn delete(&self, email: &str) -> Result<(), SinkError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.apply_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            // Absent subscriber: still success (idempotent delete)
            self.records.lock().unwrap().remove(email);
            Ok(())
        }
    }

    // =========================================================================
    // Harness
    // =========================================================================

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn event(site_id: &str, member_id: &str, event_type: EventType) -> MemberEvent {
        MemberEvent {
            site_id: site_id.to_string(),
            event_type,
            member_id: member_id.to_string(),
            email: format!("{member_id}@x.com"),
            name: String::new(),
            status: MemberStatus::Paid,
            labels: Vec::new(),
            email_enabled: true,
            signup_at: None,
            source_updated_at: ts(0),
            received_at: Utc::now(),
        }
    }

    struct Harness {
        processor: Processor,
        queue: MemoryQueue,
        sinks: HashMap<String, Arc<MockSink>>,
    }

    fn harness(site_ids: &[&str]) -> Harness {
        harness_with(site_ids, RetryPolicy::default(), BreakerConfig::default())
    }

    fn harness_with(site_ids: &[&str], retry: RetryPolicy, breaker: BreakerConfig) -> Harness {
        let mut registry = SinkRegistry::new();
        let mut sinks = HashMap::new();
        for site_id in site_ids {
            let sink = Arc::new(MockSink::default());
            registry.insert(site_id.to_string(), Arc::clone(&sink) as Arc<dyn SinkApi>);
            sinks.insert(site_id.to_string(), sink);
        }
        let metrics = Arc::new(Metrics::new(site_ids.iter().map(|s| s.to_string())));
        let processor = Processor::new(
            registry,
            Arc::new(CircuitBreaker::new(breaker)),
            retry,
            metrics,
        );
        Harness {
            processor,
            queue: MemoryQueue::new(),
            sinks,
        }
    }

    /// Retry policy with zero delays so retried items are immediately due.
    fn immediate_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_window: Duration::from_secs(86_400),
        }
    }

    // =========================================================================
    // Merge semantics
    // =========================================================================

    #[tokio::test]
    async fn test_fresh_record_upsert() {
        let h = harness(&["site-a"]);
        let mut e = event("site-a", "m1", EventType::Updated);
        e.source_updated_at = ts(100);

        let outcome = h.processor.process_event(&e).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);

        let record = h.sinks["site-a"].record("m1@x.com").unwrap();
        assert_eq!(record.status, "paid");
        assert_eq!(record.previous_status, "");
        assert_eq!(record.status_changed_at, Some(ts(100)));
        assert_eq!(record.last_updated, Some(ts(100)));
    }

    #[tokio::test]
    async fn test_status_change_sets_previous_and_refreshes_timestamp() {
        let h = harness(&["site-a"]);
        let prior = SubscriberRecord {
            email: "m1@x.com".to_string(),
            name: String::new(),
            status: "free".to_string(),
            signup_date: "2025-06-01".to_string(),
            last_updated: Some(ts(-100)),
            status_changed_at: Some(ts(-100)),
            previous_status: String::new(),
            labels: String::new(),
            email_enabled: true,
        };
        *h.sinks["site-a"].records.lock().unwrap() =
            HashMap::from([("m1@x.com".to_string(), prior)]);

        let e = event("site-a", "m1", EventType::Updated);
        h.processor.process_event(&e).await.unwrap();

        let record = h.sinks["site-a"].record("m1@x.com").unwrap();
        assert_eq!(record.previous_status, "free");
        assert!(record.status_changed_at.unwrap() > ts(-100));
        // Signup date carries forward when the event has none
        assert_eq!(record.signup_date, "2025-06-01");
    }

    #[tokio::test]
    async fn test_unchanged_status_leaves_bookkeeping_untouched() {
        let h = harness(&["site-a"]);
        let prior = SubscriberRecord {
            email: "m1@x.com".to_string(),
            name: String::new(),
            status: "paid".to_string(),
            signup_date: String::new(),
            last_updated: Some(ts(-100)),
            status_changed_at: Some(ts(-500)),
            previous_status: "free".to_string(),
            labels: String::new(),
            email_enabled: true,
        };
        *h.sinks["site-a"].records.lock().unwrap() =
            HashMap::from([("m1@x.com".to_string(), prior)]);

        let e = event("site-a", "m1", EventType::Updated);
        h.processor.process_event(&e).await.unwrap();

        let record = h.sinks["site-a"].record("m1@x.com").unwrap();
        assert_eq!(record.previous_status, "free");
        assert_eq!(record.status_changed_at, Some(ts(-500)));
        assert_eq!(record.last_updated, Some(ts(0)));
    }

    #[tokio::test]
    async fn test_stale_event_is_skipped_without_write() {
        let h = harness(&["site-a"]);
        let mut newer = event("site-a", "m1", EventType::Updated);
        newer.source_updated_at = ts(200);
        h.processor.process_event(&newer).await.unwrap();

        let mut stale = event("site-a", "m1", EventType::Updated);
        stale.source_updated_at = ts(100);
        stale.status = MemberStatus::Free;

        let outcome = h.processor.process_event(&stale).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::SkippedStale);

        let record = h.sinks["site-a"].record("m1@x.com").unwrap();
        assert_eq!(record.last_updated, Some(ts(200)));
        assert_eq!(record.status, "paid");
    }

    #[tokio::test]
    async fn test_stale_delete_is_skipped() {
        let h = harness(&["site-a"]);
        let mut newer = event("site-a", "m1", EventType::Updated);
        newer.source_updated_at = ts(200);
        h.processor.process_event(&newer).await.unwrap();

        let mut stale_delete = event("site-a", "m1", EventType::Deleted);
        stale_delete.source_updated_at = ts(100);

        let outcome = h.processor.process_event(&stale_delete).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::SkippedStale);
        assert!(h.sinks["site-a"].record("m1@x.com").is_some());
    }

    #[tokio::test]
    async fn test_idempotent_delete() {
        let h = harness(&["site-a"]);
        let e = event("site-a", "m1", EventType::Deleted);

        // Deleting a member that was never in the Sink succeeds, twice
        assert_eq!(
            h.processor.process_event(&e).await.unwrap(),
            ProcessOutcome::Applied
        );
        assert_eq!(
            h.processor.process_event(&e).await.unwrap(),
            ProcessOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_blank_name_is_preserved() {
        let h = harness(&["site-a"]);
        let e = event("site-a", "m1", EventType::Added);
        h.processor.process_event(&e).await.unwrap();

        assert_eq!(h.sinks["site-a"].record("m1@x.com").unwrap().name, "");
    }

    #[tokio::test]
    async fn test_unknown_site_is_fatal() {
        let h = harness(&["site-a"]);
        let e = event("site-b", "m1", EventType::Added);
        let err = h.processor.process_event(&e).await.unwrap_err();
        assert!(err.is_fatal());
    }

    // =========================================================================
    // Failure routing
    // =========================================================================

    #[tokio::test]
    async fn test_transient_failure_reschedules_with_attempt() {
        let h = harness_with(&["site-a"], immediate_retry(5), BreakerConfig::default());
        h.sinks["site-a"]
            .fail_applies_with(vec![SinkError::Transient("503".to_string())]);

        h.queue
            .enqueue(WorkItem::new(event("site-a", "m1", EventType::Added)))
            .await
            .unwrap();
        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let completion = h.processor.process_item(&h.queue, item).await;
        assert_eq!(completion.outcome, CompletionOutcome::Retrying);
        assert_eq!(completion.attempt_count, 1);

        let retried = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.attempt_history.len(), 1);

        // Second pass succeeds and lands the record
        let completion = h.processor.process_item(&h.queue, retried).await;
        assert_eq!(completion.outcome, CompletionOutcome::Succeeded);
        assert!(h.sinks["site-a"].record("m1@x.com").is_some());
    }

    #[tokio::test]
    async fn test_retry_bound_dead_letters_after_max_attempts() {
        let h = harness_with(&["site-a"], immediate_retry(5), BreakerConfig::default());
        h.sinks["site-a"].fail_applies_with(
            (0..5)
                .map(|i| SinkError::Transient(format!("failure {i}")))
                .collect(),
        );

        h.queue
            .enqueue(WorkItem::new(event("site-a", "m1", EventType::Added)))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
            outcomes.push(h.processor.process_item(&h.queue, item).await.outcome);
        }

        assert_eq!(
            outcomes,
            vec![
                CompletionOutcome::Retrying,
                CompletionOutcome::Retrying,
                CompletionOutcome::Retrying,
                CompletionOutcome::Retrying,
                CompletionOutcome::DeadLettered,
            ]
        );

        // Never retried a sixth time
        assert!(h.queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        let entries = h
            .queue
            .list_dead_letters(ts(-1000), Utc::now())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_history.len(), 5);
    }

    #[tokio::test]
    async fn test_fatal_failure_dead_letters_immediately() {
        let h = harness(&["site-a"]);
        h.sinks["site-a"]
            .fail_applies_with(vec![SinkError::Fatal("invalid email".to_string())]);

        h.queue
            .enqueue(WorkItem::new(event("site-a", "m1", EventType::Added)))
            .await
            .unwrap();
        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let completion = h.processor.process_item(&h.queue, item).await;
        assert_eq!(completion.outcome, CompletionOutcome::DeadLettered);
        assert_eq!(h.queue.dead_letter_depth().await.unwrap(), 1);
        assert!(h.queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        // Fatal outcomes leave the breaker untouched
        assert_eq!(
            h.processor.breaker().state("site-a").consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn test_replayed_stale_event_cannot_clobber_newer_state() {
        let h = harness_with(&["site-a"], immediate_retry(1), BreakerConfig::default());

        // t1 fails fatally and dead-letters
        h.sinks["site-a"]
            .fail_applies_with(vec![SinkError::Fatal("boom".to_string())]);
        let mut t1 = event("site-a", "m1", EventType::Updated);
        t1.source_updated_at = ts(100);
        t1.status = MemberStatus::Free;
        h.queue.enqueue(WorkItem::new(t1)).await.unwrap();
        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        h.processor.process_item(&h.queue, item).await;

        // t2 applies
        let mut t2 = event("site-a", "m1", EventType::Updated);
        t2.source_updated_at = ts(200);
        h.processor.process_event(&t2).await.unwrap();

        // Replay t1: the ordering guard makes it a no-op success
        let entries = h
            .queue
            .list_dead_letters(ts(-1000), Utc::now())
            .await
            .unwrap();
        let replayed = h.queue.replay(&entries[0]).await.unwrap();
        assert_eq!(replayed.attempt_count, 0);

        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let completion = h.processor.process_item(&h.queue, item).await;
        assert_eq!(completion.outcome, CompletionOutcome::SkippedStale);

        let record = h.sinks["site-a"].record("m1@x.com").unwrap();
        assert_eq!(record.last_updated, Some(ts(200)));
        assert_eq!(record.status, "paid");
    }

    // =========================================================================
    // Breaker interaction
    // =========================================================================

    #[tokio::test]
    async fn test_breaker_opens_and_isolates_sites() {
        let breaker_config = BreakerConfig {
            failure_threshold: 10,
            cooldown: Duration::from_secs(300),
        };
        // Long backoff keeps failed site A items parked in the delayed set
        let slow_retry = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            retry_window: Duration::from_secs(86_400),
        };
        let h = harness_with(&["site-a", "site-b"], slow_retry, breaker_config);
        h.sinks["site-a"].fail_applies_with(
            (0..10)
                .map(|i| SinkError::Transient(format!("down {i}")))
                .collect(),
        );

        // Ten distinct site A items each fail once; their retries back off
        // into the delayed set while the failures accumulate on the breaker.
        for i in 0..10 {
            h.queue
                .enqueue(WorkItem::new(event("site-a", &format!("m{i}"), EventType::Added)))
                .await
                .unwrap();
            let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
            let completion = h.processor.process_item(&h.queue, item).await;
            assert_eq!(completion.outcome, CompletionOutcome::Retrying);
        }

        assert!(h.processor.breaker().state("site-a").is_open());

        // Site B processes normally while A is open
        h.queue
            .enqueue(WorkItem::new(event("site-b", "m2", EventType::Added)))
            .await
            .unwrap();
        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let completion = h.processor.process_item(&h.queue, item).await;
        assert_eq!(completion.outcome, CompletionOutcome::Succeeded);
        assert!(h.sinks["site-b"].record("m2@x.com").is_some());
    }

    #[tokio::test]
    async fn test_open_breaker_defers_without_contacting_sink() {
        let breaker_config = BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
        };
        let h = harness_with(&["site-a"], immediate_retry(100), breaker_config);
        h.processor.breaker().record_failure("site-a");
        assert!(h.processor.breaker().state("site-a").is_open());

        let calls_before = h.sinks["site-a"].sink_calls();

        h.queue
            .enqueue(WorkItem::new(event("site-a", "m1", EventType::Added)))
            .await
            .unwrap();
        let item = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let completion = h.processor.process_item(&h.queue, item).await;

        assert_eq!(completion.outcome, CompletionOutcome::Deferred);
        assert_eq!(h.sinks["site-a"].sink_calls(), calls_before);
        assert_eq!(completion.attempt_count, 0);

        // Deferred, not dropped: still queued for after the cooldown
        assert_eq!(h.queue.depth().await.unwrap(), 1);
    }
}
