//! Source payload normalization.
//!
//! Maps the Source's native webhook payload into the canonical
//! [`MemberEvent`]. The Source wraps member data in
//! `{"member": {"current": {...}, "previous": {...}}}`; for `deleted`
//! events the data lives in `previous` with an empty `current`, so field
//! extraction falls back from `current` to `previous`.
//!
//! Unparseable payloads and unknown vocabulary are validation errors
//! surfaced to the webhook caller — malformed input never pollutes the
//! queue or the dead-letter store.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::SyncError;
use crate::model::{EventType, MemberEvent, MemberStatus};

/// Complete Source webhook payload.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub member: MemberEnvelope,
}

/// Member envelope: current state plus, for updates/deletes, the prior one.
#[derive(Debug, Deserialize)]
pub struct MemberEnvelope {
    #[serde(default)]
    pub current: Option<RawMember>,
    #[serde(default)]
    pub previous: Option<RawMember>,
}

/// Member fields as the Source sends them. Everything is optional on the
/// wire; `normalize` decides what is required for which event type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMember {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub subscribed: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<RawLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLabel {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Normalize a raw Source payload into a canonical `MemberEvent`.
///
/// Requirements by event type:
/// - `added`/`updated`: non-empty email and a recognized status
/// - `deleted`: non-empty email (taken from `previous` when `current` is
///   empty); status defaults to `free` since the Sink record is removed
pub fn normalize(
    site_id: &str,
    event_type: EventType,
    raw_body: &[u8],
) -> Result<MemberEvent, SyncError> {
    let payload: WebhookPayload = serde_json::from_slice(raw_body)
        .map_err(|e| SyncError::validation(format!("unparseable payload: {e}")))?;

    let current = payload.member.current.unwrap_or_default();
    let previous = payload.member.previous;

    let email = non_empty(current.email.clone())
        .or_else(|| non_empty(previous.as_ref().and_then(|p| p.email.clone())))
        .ok_or_else(|| SyncError::validation("missing member email"))?;

    let member_id = non_empty(current.id.clone())
        .or_else(|| non_empty(previous.as_ref().and_then(|p| p.id.clone())))
        // The Sink is keyed by email anyway; an id-less payload still routes.
        .unwrap_or_else(|| email.clone());

    let raw_status = non_empty(current.status.clone())
        .or_else(|| non_empty(previous.as_ref().and_then(|p| p.status.clone())));
    let status = match (event_type, raw_status) {
        (EventType::Deleted, raw) => raw
            .as_deref()
            .and_then(MemberStatus::parse)
            .unwrap_or(MemberStatus::Free),
        (_, Some(raw)) => MemberStatus::parse(&raw)
            .ok_or_else(|| SyncError::validation(format!("unrecognized status: {raw}")))?,
        (_, None) => return Err(SyncError::validation("missing member status")),
    };

    let name = current
        .name
        .clone()
        .or_else(|| previous.as_ref().and_then(|p| p.name.clone()))
        .unwrap_or_default();

    let labels = if current.labels.is_empty() {
        previous
            .as_ref()
            .map(|p| dedup_labels(&p.labels))
            .unwrap_or_default()
    } else {
        dedup_labels(&current.labels)
    };

    let email_enabled = current
        .subscribed
        .or_else(|| previous.as_ref().and_then(|p| p.subscribed))
        .unwrap_or(true);

    let received_at = Utc::now();
    let source_updated_at = current
        .updated_at
        .or_else(|| previous.as_ref().and_then(|p| p.updated_at))
        .unwrap_or(received_at);
    let signup_at = current
        .created_at
        .or_else(|| previous.as_ref().and_then(|p| p.created_at));

    Ok(MemberEvent {
        site_id: site_id.to_string(),
        event_type,
        member_id,
        email,
        name,
        status,
        labels,
        email_enabled,
        signup_at,
        source_updated_at,
        received_at,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Ordered label set: keep Source order, drop duplicates.
fn dedup_labels(labels: &[RawLabel]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    labels
        .iter()
        .filter(|l| seen.insert(l.name.clone()))
        .map(|l| l.name.clone())
        .collect()
}
