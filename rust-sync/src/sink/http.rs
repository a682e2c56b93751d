//! HTTP Sink client.
//!
//! Talks to the Sink's subscriber REST API (Campaign-Monitor-v3.3 shaped):
//! `GET/POST/DELETE {base}/subscribers/{list_id}.json`, basic auth with the
//! site's API key. One client per site over a shared pooled `reqwest`
//! connection; the request timeout comes from config, and a timed-out call
//! classifies transient.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SinkApi, SinkError, SinkRegistry};
use crate::config::{Config, SiteContext};
use crate::model::SubscriberRecord;
use crate::util::hash_email;

/// Sink error body code for "subscriber not found".
const NOT_FOUND_CODE: i64 = 203;

/// Build the per-site client registry from config. Called once at startup.
pub fn build_registry(config: &Config) -> anyhow::Result<SinkRegistry> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .timeout(config.sink_timeout)
        .build()?;

    let mut registry = SinkRegistry::new();
    for site in &config.sites {
        registry.insert(
            site.site_id.clone(),
            Arc::new(HttpSinkClient::new(
                client.clone(),
                config.sink_base_url.clone(),
                site,
            )) as Arc<dyn SinkApi>,
        );
    }
    Ok(registry)
}

/// Sink client for one site's list.
pub struct HttpSinkClient {
    client: reqwest::Client,
    base_url: String,
    list_id: String,
    api_key: String,
    site_id: String,
}

impl HttpSinkClient {
    pub fn new(client: reqwest::Client, base_url: String, site: &SiteContext) -> Self {
        Self {
            client,
            base_url,
            list_id: site.sink_list_id.clone(),
            api_key: site.sink_api_key.clone(),
            site_id: site.site_id.clone(),
        }
    }

    fn subscribers_url(&self) -> String {
        format!(
            "{}/subscribers/{}.json",
            self.base_url.trim_end_matches('/'),
            self.list_id
        )
    }
}

#[async_trait]
impl SinkApi for HttpSinkClient {
    async fn fetch(&self, email: &str) -> Result<Option<SubscriberRecord>, SinkError> {
        let response = self
            .client
            .get(self.subscribers_url())
            .basic_auth(&self.api_key, Some(""))
            .query(&[("email", email)])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(request_error)?;

        match status {
            200 => {
                let detail: ApiSubscriberDetail = serde_json::from_str(&body).map_err(|e| {
                    SinkError::Transient(format!("unparseable sink response: {e}"))
                })?;
                Ok(Some(record_from_api(detail)))
            }
            404 => Ok(None),
            400 if is_not_found(&body) => Ok(None),
            _ => Err(classify_status(status, &body)),
        }
    }

    async fn upsert(&self, record: &SubscriberRecord) -> Result<(), SinkError> {
        let payload = ApiSubscriber::from_record(record);
        let response = self
            .client
            .post(self.subscribers_url())
            .basic_auth(&self.api_key, Some(""))
            .json(&payload)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        match status {
            200 | 201 => {
                info!(
                    site_id = %self.site_id,
                    email_hash = %hash_email(&record.email),
                    status = %record.status,
                    "subscriber_upserted"
                );
                Ok(())
            }
            _ => {
                let body = response.text().await.map_err(request_error)?;
                Err(classify_status(status, &body))
            }
        }
    }

    async fn delete(&self, email: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .delete(self.subscribers_url())
            .basic_auth(&self.api_key, Some(""))
            .query(&[("email", email)])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        match status {
            200 | 201 | 204 | 404 => {
                info!(
                    site_id = %self.site_id,
                    email_hash = %hash_email(email),
                    "subscriber_deleted"
                );
                Ok(())
            }
            _ => {
                let body = response.text().await.map_err(request_error)?;
                // Deleting an absent subscriber is success, not an error
                if status == 400 && is_not_found(&body) {
                    return Ok(());
                }
                Err(classify_status(status, &body))
            }
        }
    }
}

fn request_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Transient("request timed out".to_string())
    } else {
        SinkError::Transient(format!("request failed: {e}"))
    }
}

/// Map a non-success HTTP status to a failure class.
fn classify_status(status: u16, body: &str) -> SinkError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 => SinkError::RateLimited(format!("sink rate limited ({status}): {snippet}")),
        408 => SinkError::Transient(format!("sink request timeout ({status})")),
        s if s >= 500 => SinkError::Transient(format!("sink server error ({status}): {snippet}")),
        _ => SinkError::Fatal(format!("sink rejected request ({status}): {snippet}")),
    }
}

fn is_not_found(body: &str) -> bool {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.code == NOT_FOUND_CODE)
        .unwrap_or(false)
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Code")]
    code: i64,
    #[serde(rename = "Message", default)]
    #[allow(dead_code)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ApiCustomField {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Serialize)]
struct ApiSubscriber {
    #[serde(rename = "EmailAddress")]
    email_address: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CustomFields")]
    custom_fields: Vec<ApiCustomField>,
    #[serde(rename = "Resubscribe")]
    resubscribe: bool,
    #[serde(rename = "ConsentToTrack")]
    consent_to_track: &'static str,
}

impl ApiSubscriber {
    fn from_record(record: &SubscriberRecord) -> Self {
        let field = |key: &str, value: String| ApiCustomField {
            key: key.to_string(),
            value,
        };
        Self {
            email_address: record.email.clone(),
            name: record.name.clone(),
            custom_fields: vec![
                field("ghost_status", record.status.clone()),
                field("ghost_signup_date", record.signup_date.clone()),
                field(
                    "ghost_last_updated",
                    record.last_updated.map(format_timestamp).unwrap_or_default(),
                ),
                field(
                    "ghost_status_changed_at",
                    record
                        .status_changed_at
                        .map(format_timestamp)
                        .unwrap_or_default(),
                ),
                field("ghost_previous_status", record.previous_status.clone()),
                field("ghost_labels", record.labels.clone()),
                field("ghost_email_enabled", record.email_enabled.to_string()),
            ],
            resubscribe: true,
            consent_to_track: "Yes",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiSubscriberDetail {
    #[serde(rename = "EmailAddress")]
    email_address: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CustomFields", default)]
    custom_fields: Vec<ApiCustomField>,
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_timestamp(v: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(v)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn record_from_api(detail: ApiSubscriberDetail) -> SubscriberRecord {
    let mut record = SubscriberRecord {
        email: detail.email_address,
        name: detail.name,
        status: String::new(),
        signup_date: String::new(),
        last_updated: None,
        status_changed_at: None,
        previous_status: String::new(),
        labels: String::new(),
        email_enabled: true,
    };

    for field in detail.custom_fields {
        match field.key.as_str() {
            "ghost_status" => record.status = field.value,
            "ghost_signup_date" => record.signup_date = field.value,
            "ghost_last_updated" => record.last_updated = parse_timestamp(&field.value),
            "ghost_status_changed_at" => {
                record.status_changed_at = parse_timestamp(&field.value)
            }
            "ghost_previous_status" => record.previous_status = field.value,
            "ghost_labels" => record.labels = field.value,
            "ghost_email_enabled" => record.email_enabled = field.value == "true",
            _ => {}
        }
    }
    record
}
