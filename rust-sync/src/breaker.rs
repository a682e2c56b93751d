//! Per-site circuit breaker.
//!
//! Tracks consecutive Sink failures for each site and suspends delivery
//! attempts once a threshold is crossed, so one failing Sink list cannot
//! burn retry budget or starve other sites. While open, `allow` returns
//! false until the cooldown elapses; the first call after the cooldown is
//! the probe. A successful probe closes the breaker, a failed probe
//! restarts the cooldown.
//!
//! State is a single read-modify-write per outcome, shared by all worker
//! tasks in the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Breaker tuning for one deployment.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long deliveries stay suspended before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Breaker state for a single site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    /// Set while the breaker is open; also the start of the current cooldown.
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

/// State transition caused by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    None,
    Opened,
    Closed,
}

/// Per-site circuit breaker registry.
pub struct CircuitBreaker {
    config: BreakerConfig,
    sites: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            sites: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// Whether a delivery attempt for this site may proceed.
    ///
    /// Open breakers admit one attempt per call once the cooldown has
    /// elapsed (the probe); the breaker only closes when that probe's
    /// success is recorded.
    pub fn allow(&self, site_id: &str) -> bool {
        let sites = self.lock();
        match sites.get(site_id).and_then(|s| s.opened_at) {
            None => true,
            Some(opened_at) => {
                let elapsed = Utc::now().signed_duration_since(opened_at);
                elapsed >= chrono::Duration::seconds(self.config.cooldown.as_secs() as i64)
            }
        }
    }

    /// Record a successful Sink outcome: resets the failure count and closes
    /// the breaker if it was open.
    pub fn record_success(&self, site_id: &str) -> BreakerTransition {
        let mut sites = self.lock();
        let state = sites.entry(site_id.to_string()).or_default();
        let was_open = state.is_open();
        state.consecutive_failures = 0;
        state.opened_at = None;

        if was_open {
            info!(site_id = %site_id, "circuit_breaker_closed");
            BreakerTransition::Closed
        } else {
            BreakerTransition::None
        }
    }

    /// Record a failed Sink outcome. Opens the breaker at the threshold;
    /// restarts the cooldown when a probe fails.
    pub fn record_failure(&self, site_id: &str) -> BreakerTransition {
        let mut sites = self.lock();
        let state = sites.entry(site_id.to_string()).or_default();
        state.consecutive_failures += 1;

        if state.is_open() {
            state.opened_at = Some(Utc::now());
            warn!(
                site_id = %site_id,
                consecutive_failures = state.consecutive_failures,
                "circuit_breaker_cooldown_restarted"
            );
            BreakerTransition::None
        } else if state.consecutive_failures >= self.config.failure_threshold {
            state.opened_at = Some(Utc::now());
            warn!(
                site_id = %site_id,
                consecutive_failures = state.consecutive_failures,
                threshold = self.config.failure_threshold,
                cooldown_seconds = self.config.cooldown.as_secs(),
                "circuit_breaker_opened"
            );
            BreakerTransition::Opened
        } else {
            BreakerTransition::None
        }
    }

    /// Current state for one site (default closed when never seen).
    pub fn state(&self, site_id: &str) -> BreakerState {
        self.lock().get(site_id).copied().unwrap_or_default()
    }

    /// Stable-ordered snapshot of every tracked site, for `/health`.
    pub fn snapshot(&self) -> BTreeMap<String, BreakerState> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BreakerState>> {
        self.sites.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, site_id: &str, state: BreakerState) {
        self.lock().insert(site_id.to_string(), state);
    }
}
