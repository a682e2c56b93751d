//! Canonical data model for the sync pipeline.
//!
//! This module defines:
//! - `MemberEvent`: the normalized unit of work produced from a Source webhook
//! - `WorkItem`: a `MemberEvent` plus queue bookkeeping (attempts, schedule)
//! - `SubscriberRecord`: the Sink-side view of a subscriber
//! - `DeadLetterEntry`: the terminal record for events that exhaust retries
//! - `Completion`: the structured per-item outcome record

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::util::hash_email;

// =============================================================================
// Event vocabulary
// =============================================================================

/// Membership lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// Parse the route-level event name. Anything else is rejected upstream.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(Self::Added),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership status on the Source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Free,
    Paid,
    Comped,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
            Self::Comped => "comped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "paid" => Some(Self::Paid),
            "comped" => Some(Self::Comped),
            _ => None,
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Member event
// =============================================================================

/// Canonical unit of work: one membership lifecycle event for one site.
///
/// `name` may be an empty string and is synced verbatim, never replaced with
/// a placeholder. For `deleted` events only `member_id`/`email` carry
/// meaning; the remaining fields hold defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEvent {
    pub site_id: String,
    pub event_type: EventType,
    pub member_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub status: MemberStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    pub email_enabled: bool,
    /// Source-side signup timestamp, when the payload carried one.
    #[serde(default)]
    pub signup_at: Option<DateTime<Utc>>,
    pub source_updated_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl MemberEvent {
    /// Identifier collapsing duplicate deliveries of the same logical event.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.site_id,
            self.member_id,
            self.event_type,
            self.source_updated_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

// =============================================================================
// Queued work
// =============================================================================

/// Error classification for a failed Sink attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Fatal => "fatal",
        }
    }
}

/// One failed delivery attempt, kept on the work item for DLQ forensics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub at: DateTime<Utc>,
    pub error_class: ErrorClass,
    pub message: String,
}

/// A `MemberEvent` wrapped with queue bookkeeping.
///
/// Created on enqueue, mutated (attempt count, schedule) on each retry,
/// destroyed on ack or dead-letter transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub event: MemberEvent,
    /// Per-delivery id for log correlation; replays get a fresh one.
    pub event_id: Uuid,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub first_enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
}

impl WorkItem {
    pub fn new(event: MemberEvent) -> Self {
        let now = Utc::now();
        let idempotency_key = event.idempotency_key();
        Self {
            event,
            event_id: Uuid::new_v4(),
            idempotency_key,
            attempt_count: 0,
            first_enqueued_at: now,
            next_attempt_at: now,
            attempt_history: Vec::new(),
        }
    }

    /// Dedup scope: the member this item belongs to.
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.event.site_id, self.event.member_id)
    }

    /// Build the dead-letter record for this item, appending the attempt
    /// that pushed it over the edge when there was one.
    pub fn to_dead_letter(
        &self,
        failure_reason: impl Into<String>,
        final_attempt: Option<AttemptRecord>,
    ) -> DeadLetterEntry {
        let mut attempt_history = self.attempt_history.clone();
        if let Some(attempt) = final_attempt {
            attempt_history.push(attempt);
        }
        DeadLetterEntry {
            event: self.event.clone(),
            failure_reason: failure_reason.into(),
            attempt_history,
            moved_at: Utc::now(),
        }
    }
}

// =============================================================================
// Sink-side view
// =============================================================================

/// The Sink's record for one subscriber, as the pipeline sees it.
///
/// The Sink owns this data; the pipeline only reads then conditionally
/// overwrites it. Fields map onto the Sink custom-field set
/// (`ghost_status`, `ghost_signup_date`, `ghost_last_updated`,
/// `ghost_status_changed_at`, `ghost_previous_status`, `ghost_labels`,
/// `ghost_email_enabled`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    /// Date-only signup stamp (`YYYY-MM-DD`), empty when never recorded.
    #[serde(default)]
    pub signup_date: String,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_status: String,
    /// Comma-joined label names.
    #[serde(default)]
    pub labels: String,
    pub email_enabled: bool,
}

// =============================================================================
// Dead letters
// =============================================================================

/// Terminal record for an event that exhausted its retry budget or hit a
/// fatal Sink outcome. Replay turns it back into a fresh `WorkItem` while
/// preserving the original event (including `source_updated_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: MemberEvent,
    pub failure_reason: String,
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
    pub moved_at: DateTime<Utc>,
}

// =============================================================================
// Completion records
// =============================================================================

/// Final disposition of one processed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    SkippedStale,
    Retrying,
    Deferred,
    DeadLettered,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SkippedStale => "skipped_stale",
            Self::Retrying => "retrying",
            Self::Deferred => "deferred",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Structured completion record, emitted exactly once per processed item.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub site_id: String,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub email_hash: String,
    pub outcome: CompletionOutcome,
    pub attempt_count: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Completion {
    pub fn new(item: &WorkItem, outcome: CompletionOutcome, latency_ms: u64) -> Self {
        Self {
            site_id: item.event.site_id.clone(),
            event_id: item.event_id,
            event_type: item.event.event_type,
            email_hash: hash_email(&item.event.email),
            outcome,
            attempt_count: item.attempt_count,
            latency_ms,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Emit the record as a structured log event.
    pub fn emit(&self) {
        match self.outcome {
            CompletionOutcome::Succeeded | CompletionOutcome::SkippedStale => info!(
                site_id = %self.site_id,
                event_id = %self.event_id,
                event_type = %self.event_type,
                email_hash = %self.email_hash,
                outcome = self.outcome.as_str(),
                attempt_count = self.attempt_count,
                latency_ms = self.latency_ms,
                "event_completed"
            ),
            CompletionOutcome::Retrying | CompletionOutcome::Deferred => warn!(
                site_id = %self.site_id,
                event_id = %self.event_id,
                event_type = %self.event_type,
                email_hash = %self.email_hash,
                outcome = self.outcome.as_str(),
                attempt_count = self.attempt_count,
                latency_ms = self.latency_ms,
                detail = ?self.detail,
                "event_completed"
            ),
            CompletionOutcome::DeadLettered => error!(
                site_id = %self.site_id,
                event_id = %self.event_id,
                event_type = %self.event_type,
                email_hash = %self.email_hash,
                outcome = self.outcome.as_str(),
                attempt_count = self.attempt_count,
                latency_ms = self.latency_ms,
                detail = ?self.detail,
                "event_completed"
            ),
        }
    }
}
