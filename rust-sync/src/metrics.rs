//! Per-site event counters for the `/metrics` endpoint.
//!
//! Counters are plain atomics bumped by the web layer and the processor;
//! the snapshot is assembled on demand and served as JSON. Sites are fixed
//! at startup, so the map is never mutated after construction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counter kinds tracked per site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Enqueued,
    Coalesced,
    Succeeded,
    StaleSkipped,
    Retried,
    Deferred,
    DeadLettered,
    BreakerOpened,
    BreakerClosed,
}

#[derive(Default)]
struct SiteCounters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    succeeded: AtomicU64,
    stale_skipped: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
    breaker_opened: AtomicU64,
    breaker_closed: AtomicU64,
}

impl SiteCounters {
    fn incr(&self, counter: Counter) {
        let cell = match counter {
            Counter::Enqueued => &self.enqueued,
            Counter::Coalesced => &self.coalesced,
            Counter::Succeeded => &self.succeeded,
            Counter::StaleSkipped => &self.stale_skipped,
            Counter::Retried => &self.retried,
            Counter::Deferred => &self.deferred,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::BreakerOpened => &self.breaker_opened,
            Counter::BreakerClosed => &self.breaker_closed,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SiteCountersSnapshot {
        SiteCountersSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            breaker_opened: self.breaker_opened.load(Ordering::Relaxed),
            breaker_closed: self.breaker_closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values for one site.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SiteCountersSnapshot {
    pub enqueued: u64,
    pub coalesced: u64,
    pub succeeded: u64,
    pub stale_skipped: u64,
    pub retried: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    pub breaker_opened: u64,
    pub breaker_closed: u64,
}

impl SiteCountersSnapshot {
    fn add(&mut self, other: &SiteCountersSnapshot) {
        self.enqueued += other.enqueued;
        self.coalesced += other.coalesced;
        self.succeeded += other.succeeded;
        self.stale_skipped += other.stale_skipped;
        self.retried += other.retried;
        self.deferred += other.deferred;
        self.dead_lettered += other.dead_lettered;
        self.breaker_opened += other.breaker_opened;
        self.breaker_closed += other.breaker_closed;
    }
}

/// The `/metrics` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sites: BTreeMap<String, SiteCountersSnapshot>,
    pub totals: SiteCountersSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_depth: Option<usize>,
    pub uptime_seconds: u64,
}

/// Counter registry, one slot per configured site.
pub struct Metrics {
    started_at: DateTime<Utc>,
    sites: HashMap<String, SiteCounters>,
}

impl Metrics {
    pub fn new(site_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            started_at: Utc::now(),
            sites: site_ids
                .into_iter()
                .map(|id| (id, SiteCounters::default()))
                .collect(),
        }
    }

    /// Bump one counter. Unknown sites are ignored; routing guarantees only
    /// configured sites reach the pipeline.
    pub fn incr(&self, site_id: &str, counter: Counter) {
        if let Some(counters) = self.sites.get(site_id) {
            counters.incr(counter);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut totals = SiteCountersSnapshot::default();
        let mut sites = BTreeMap::new();
        for (site_id, counters) in &self.sites {
            let snap = counters.snapshot();
            totals.add(&snap);
            sites.insert(site_id.clone(), snap);
        }

        MetricsSnapshot {
            sites,
            totals,
            queue_depth: None,
            dead_letter_depth: None,
            uptime_seconds: Utc::now()
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0) as u64,
        }
    }
}
