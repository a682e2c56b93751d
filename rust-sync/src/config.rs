//! Configuration module for environment variable parsing.
//!
//! All tunables come from environment variables. The site collection is the
//! one required value: `SITES` holds a JSON array of per-site contexts,
//! parsed once at startup into an explicit ordered collection and looked up
//! by `site_id` — no runtime field-name synthesis.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;

/// Immutable per-site identity.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteContext {
    /// Route segment identifying the site.
    pub site_id: String,
    /// Secret for webhook signature verification.
    pub webhook_secret: String,
    /// The Sink list this site syncs into.
    pub sink_list_id: String,
    /// API key authorizing Sink calls for this list.
    pub sink_api_key: String,
    /// Source API base URL, used by resync tooling.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Source admin API key, used by resync tooling.
    #[serde(default)]
    pub source_admin_key: Option<String>,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered site collection; routing rejects anything not listed here.
    pub sites: Vec<SiteContext>,

    /// Redis connection URL for the durable queue.
    pub redis_url: String,

    /// Base URL of the Sink subscriber API.
    pub sink_base_url: String,

    /// Port for the web server to listen on.
    pub port: u16,

    /// Number of concurrent worker tasks pulling from the queue.
    pub worker_concurrency: usize,

    /// Per-request timeout for Sink calls.
    pub sink_timeout: Duration,

    /// Maximum accepted age of a webhook timestamp header.
    pub signature_max_age: Duration,

    /// Retry/backoff parameters.
    pub retry: RetryPolicy,

    /// Circuit breaker parameters.
    pub breaker: BreakerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let sites_raw =
            env::var("SITES").context("SITES must be set to a JSON array of site contexts")?;
        let sites: Vec<SiteContext> =
            serde_json::from_str(&sites_raw).context("SITES is not a valid JSON array")?;
        if sites.is_empty() {
            bail!("SITES must contain at least one site");
        }
        let mut seen = std::collections::HashSet::new();
        for site in &sites {
            if !seen.insert(site.site_id.as_str()) {
                bail!("duplicate site_id in SITES: {}", site.site_id);
            }
        }

        Ok(Config {
            sites,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            sink_base_url: env::var("SINK_BASE_URL")
                .unwrap_or_else(|_| "https://api.createsend.com/api/v3.3".to_string()),

            port: parse_env("PORT", 3000),

            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4),

            sink_timeout: Duration::from_secs(parse_env("SINK_TIMEOUT_SECS", 10)),

            signature_max_age: Duration::from_secs(parse_env("SIGNATURE_MAX_AGE_SECS", 300)),

            retry: RetryPolicy {
                max_attempts: parse_env("RETRY_MAX_ATTEMPTS", 5),
                base_delay: Duration::from_secs(parse_env("RETRY_BASE_DELAY_SECS", 1)),
                max_delay: Duration::from_secs(parse_env("RETRY_MAX_DELAY_SECS", 16)),
                retry_window: Duration::from_secs(parse_env("RETRY_WINDOW_SECS", 86_400)),
            },

            breaker: BreakerConfig {
                failure_threshold: parse_env("BREAKER_FAILURE_THRESHOLD", 10),
                cooldown: Duration::from_secs(parse_env("BREAKER_COOLDOWN_SECS", 300)),
            },
        })
    }

    /// Look up a site by id. Unknown ids are a routing error.
    pub fn site(&self, site_id: &str) -> Option<&SiteContext> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.sites.iter().map(|s| s.site_id.clone()).collect()
    }
}

/// Parse an environment variable, falling back to a default on absence or
/// malformed input.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITES_JSON: &str = r#"[
        {
            "site_id": "site-a",
            "webhook_secret": "secret-a",
            "sink_list_id": "list-a",
            "sink_api_key": "key-a"
        },
        {
            "site_id": "site-b",
            "webhook_secret": "secret-b",
            "sink_list_id": "list-b",
            "sink_api_key": "key-b",
            "source_url": "https://b.example.com",
            "source_admin_key": "id:abcdef"
        }
    ]"#;

    #[test]
    fn test_site_context_parsing() {
        let sites: Vec<SiteContext> = serde_json::from_str(SITES_JSON).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].site_id, "site-a");
        assert!(sites[0].source_url.is_none());
        assert_eq!(sites[1].source_url.as_deref(), Some("https://b.example.com"));
    }

    #[test]
    fn test_parse_env_default() {
        let result: u64 = parse_env("NONEXISTENT_VAR_FOR_TEST", 42);
        assert_eq!(result, 42);
    }

    #[test]
    fn test_parse_env_invalid_falls_back() {
        env::set_var("MEMBERSYNC_TEST_BAD_NUMBER", "not-a-number");
        let result: u64 = parse_env("MEMBERSYNC_TEST_BAD_NUMBER", 7);
        assert_eq!(result, 7);
        env::remove_var("MEMBERSYNC_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_from_env_round_trip() {
        env::set_var("SITES", SITES_JSON);
        let config = Config::from_env().unwrap();

        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.breaker.failure_threshold, 10);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(300));

        assert!(config.site("site-a").is_some());
        assert!(config.site("site-c").is_none());
        assert_eq!(config.site_ids(), vec!["site-a", "site-b"]);

        env::remove_var("SITES");
    }
}
