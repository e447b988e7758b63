use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value, json};

use leadflow_config::ResetBoundary;
use leadflow_core::{FlowError, Result};

use crate::platform::{CrmPlatform, ExternalRecord, ListPage, RateBudget, SyncFilters, WebhookEvent};

/// Apollo people search. Read-only prospect source; imported daily.
pub struct ApolloPlatform {
    client: Client,
    api_key: String,
    base_url: String,
    daily_budget: u64,
}

impl ApolloPlatform {
    pub fn new(api_key: String, daily_budget: u64) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.apollo.io/v1".into(),
            daily_budget,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn record_from_person(person: &Value) -> Option<ExternalRecord> {
        let external_id = person["id"].as_str()?.to_string();
        let mut fields = Map::new();
        if let Some(url) = person["linkedin_url"].as_str() {
            fields.insert("linkedin_url".into(), json!(url));
        }
        if let Some(seniority) = person["seniority"].as_str() {
            fields.insert("seniority".into(), json!(seniority));
        }
        Some(ExternalRecord {
            external_id,
            email: person["email"].as_str().map(String::from),
            name: person["name"].as_str().map(String::from),
            title: person["title"].as_str().map(String::from),
            phone: person["phone_numbers"][0]["sanitized_number"]
                .as_str()
                .map(String::from),
            company: person["organization"]["name"].as_str().map(String::from),
            fields,
            updated_at: person["updated_at"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl CrmPlatform for ApolloPlatform {
    fn name(&self) -> &str {
        "apollo"
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
        let page: u64 = cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(1);
        let mut body = json!({
            "api_key": self.api_key,
            "page": page,
            "per_page": filters.page_size.unwrap_or(100),
        });
        if let Some(list_id) = &filters.list_id {
            body["label_ids"] = json!([list_id]);
        }

        let resp = self
            .client
            .post(format!("{}/mixed_people/search", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FlowError::Timeout(e.to_string())
                } else {
                    FlowError::Upstream(e.to_string())
                }
            })?;

        let remaining = resp
            .headers()
            .get("x-rate-limit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => FlowError::Auth(format!("HTTP {status}: {body}")),
                422 => FlowError::BadRequest(format!("HTTP {status}: {body}")),
                429 => FlowError::RateLimited {
                    retry_after_secs: None,
                },
                _ => FlowError::Upstream(format!("HTTP {status}: {body}")),
            });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;
        let records: Vec<ExternalRecord> = data["people"]
            .as_array()
            .map(|people| people.iter().filter_map(Self::record_from_person).collect())
            .unwrap_or_default();
        let total_pages = data["pagination"]["total_pages"].as_u64().unwrap_or(page);
        let next_cursor = (page < total_pages).then(|| (page + 1).to_string());

        Ok(ListPage {
            records,
            next_cursor,
            rate_limit_remaining: remaining,
        })
    }

    async fn get(&self, external_id: &str) -> Result<Option<ExternalRecord>> {
        let data: Value = self
            .client
            .post(format!("{}/people/match", self.base_url))
            .json(&json!({ "api_key": self.api_key, "id": external_id }))
            .send()
            .await
            .map_err(|e| FlowError::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;
        Ok(Self::record_from_person(&data["person"]))
    }

    async fn upsert(&self, _record: &ExternalRecord) -> Result<()> {
        Err(FlowError::BadRequest("apollo is read-only".into()))
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent> {
        // Apollo has no change webhooks; anything inbound is unknown.
        Ok(WebhookEvent::Unknown {
            kind: payload["type"].as_str().unwrap_or("apollo").into(),
        })
    }
}
