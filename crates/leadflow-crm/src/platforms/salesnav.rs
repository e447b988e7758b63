use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value, json};

use leadflow_config::ResetBoundary;
use leadflow_core::{FlowError, Result};

use crate::platform::{CrmPlatform, ExternalRecord, ListPage, RateBudget, SyncFilters, WebhookEvent};

/// Sales Navigator lead lists via the export API. Read-only, with a
/// tight daily budget; imported once a day.
pub struct SalesNavPlatform {
    client: Client,
    token: String,
    base_url: String,
    daily_budget: u64,
}

impl SalesNavPlatform {
    pub fn new(token: String, daily_budget: u64) -> Self {
        Self {
            client: Client::new(),
            token,
            base_url: "https://api.linkedin.com/v2".into(),
            daily_budget,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn record_from_lead(lead: &Value) -> Option<ExternalRecord> {
        let external_id = lead["entityUrn"].as_str()?.to_string();
        let mut fields = Map::new();
        if let Some(geo) = lead["geoRegion"].as_str() {
            fields.insert("geo_region".into(), json!(geo));
        }
        Some(ExternalRecord {
            external_id,
            email: None, // not exposed by the API
            name: lead["fullName"].as_str().map(String::from),
            title: lead["currentPosition"]["title"].as_str().map(String::from),
            phone: None,
            company: lead["currentPosition"]["companyName"]
                .as_str()
                .map(String::from),
            fields,
            updated_at: lead["lastUpdatedAt"]
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl CrmPlatform for SalesNavPlatform {
    fn name(&self) -> &str {
        "salesnav"
    }

    fn writable(&self) -> bool {
        false
    }

    fn rate_budget(&self) -> RateBudget {
        RateBudget {
            calls: self.daily_budget,
            boundary: ResetBoundary::Day,
        }
    }

    async fn list(&self, filters: &SyncFilters, cursor: Option<String>) -> Result<ListPage> {
        let start: u64 = cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0);
        let count = filters.page_size.unwrap_or(50) as u64;
        let mut url = format!(
            "{}/salesNavigatorLeads?q=savedList&start={start}&count={count}",
            self.base_url
        );
        if let Some(list_id) = &filters.list_id {
            url.push_str(&format!("&listId={list_id}"));
        }

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FlowError::Timeout(e.to_string())
                } else {
                    FlowError::Upstream(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => FlowError::Auth(format!("HTTP {status}: {body}")),
                429 => FlowError::RateLimited {
                    retry_after_secs: Some(3600),
                },
                _ => FlowError::Upstream(format!("HTTP {status}: {body}")),
            });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;
        let records: Vec<ExternalRecord> = data["elements"]
            .as_array()
            .map(|leads| leads.iter().filter_map(Self::record_from_lead).collect())
            .unwrap_or_default();
        let total = data["paging"]["total"].as_u64().unwrap_or(0);
        let next = start + records.len() as u64;
        let next_cursor = (next < total && !records.is_empty()).then(|| next.to_string());

        Ok(ListPage {
            records,
            next_cursor,
            rate_limit_remaining: None,
        })
    }

    async fn get(&self, _external_id: &str) -> Result<Option<ExternalRecord>> {
        // Single-lead lookup is not exposed; callers go through list().
        Ok(None)
    }

    async fn upsert(&self, _record: &ExternalRecord) -> Result<()> {
        Err(FlowError::BadRequest("salesnav is read-only".into()))
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent> {
        Ok(WebhookEvent::Unknown {
            kind: payload["eventType"].as_str().unwrap_or("salesnav").into(),
        })
    }
}
