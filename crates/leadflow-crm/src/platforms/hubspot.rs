use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::debug;

use leadflow_config::ResetBoundary;
use leadflow_core::{FlowError, Result};

use crate::platform::{CrmPlatform, ExternalRecord, ListPage, RateBudget, SyncFilters, WebhookEvent};

/// HubSpot contacts API. Read-write; the primary periodic sync target.
pub struct HubSpotPlatform {
    client: Client,
    token: String,
    base_url: String,
    daily_budget: u64,
}

impl HubSpotPlatform {
    pub fn new(token: String, daily_budget: u64) -> Self {
        Self {
            client: Client::new(),
            token,
            base_url: "https://api.hubapi.com".into(),
            daily_budget,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn map_status(status: u16, retry_after: Option<u64>, body: &str) -> FlowError {
        match status {
            401 | 403 => FlowError::Auth(format!("HTTP {status}: {body}")),
            400 | 404 | 422 => FlowError::BadRequest(format!("HTTP {status}: {body}")),
            429 => FlowError::RateLimited {
                retry_after_secs: retry_after,
            },
            _ => FlowError::Upstream(format!("HTTP {status}: {body}")),
        }
    }

    fn record_from_object(object: &Value) -> Option<ExternalRecord> {
        let external_id = object["id"].as_str()?.to_string();
        let props = &object["properties"];
        let name = match (props["firstname"].as_str(), props["lastname"].as_str()) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.to_string()),
            (None, Some(last)) => Some(last.to_string()),
            (None, None) => None,
        };
        let updated_at = object["updatedAt"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut fields = Map::new();
        if let Some(map) = props.as_object() {
            for (key, value) in map {
                if !matches!(
                    key.as_str(),
                    "firstname" | "lastname" | "email" | "jobtitle" | "phone" | "company"
                ) {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }

        Some(ExternalRecord {
            external_id,
            email: props["email"].as_str().map(String::from),
            name,
            title: props["jobtitle"].as_str().map(String::from),
            phone: props["phone"].as_str().map(String::from),
            company: props["company"].as_str().map(String::from),
            fields,
            updated_at,
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req
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
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, retry_after, &body));
        }
        resp.json().await.map_err(|e| FlowError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl CrmPlatform for HubSpotPlatform {
    fn name(&self) -> &str {
        "hubspot"
    }

    fn writable(&self) -> bool {
        true
    }

    fn rate_budget(&self) -> RateBudget {
        RateBudget {
            calls: self.daily_budget,
            boundary: ResetBoundary::Day,
        }
    }

    async fn list(&self, filters: &SyncFilters, cursor: Option<String>) -> Result<ListPage> {
        let mut body = json!({
            "limit": filters.page_size.unwrap_or(100),
            "properties": ["firstname", "lastname", "email", "jobtitle", "phone", "company"],
            "sorts": [{ "propertyName": "lastmodifieddate", "direction": "ASCENDING" }],
        });
        if let Some(since) = filters.modified_since {
            body["filterGroups"] = json!([{
                "filters": [{
                    "propertyName": "lastmodifieddate",
                    "operator": "GT",
                    "value": since.timestamp_millis().to_string(),
                }],
            }]);
        }
        if let Some(after) = cursor {
            body["after"] = json!(after);
        }
        debug!("listing hubspot contacts page");

        let data = self
            .send(
                self.client
                    .post(format!("{}/crm/v3/objects/contacts/search", self.base_url))
                    .json(&body),
            )
            .await?;

        let records = data["results"]
            .as_array()
            .map(|objects| objects.iter().filter_map(Self::record_from_object).collect())
            .unwrap_or_default();
        let next_cursor = data["paging"]["next"]["after"].as_str().map(String::from);

        Ok(ListPage {
            records,
            next_cursor,
            rate_limit_remaining: None,
        })
    }

    async fn get(&self, external_id: &str) -> Result<Option<ExternalRecord>> {
        let url = format!(
            "{}/crm/v3/objects/contacts/{}?properties=firstname,lastname,email,jobtitle,phone,company",
            self.base_url, external_id
        );
        match self.send(self.client.get(url)).await {
            Ok(data) => Ok(Self::record_from_object(&data)),
            Err(FlowError::BadRequest(msg)) if msg.starts_with("HTTP 404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, record: &ExternalRecord) -> Result<()> {
        let (first, last) = match record.name.as_deref().map(|n| n.split_once(' ')) {
            Some(Some((first, last))) => (Some(first.to_string()), Some(last.to_string())),
            Some(None) => (record.name.clone(), None),
            None => (None, None),
        };
        let mut properties = Map::new();
        if let Some(email) = &record.email {
            properties.insert("email".into(), json!(email));
        }
        if let Some(first) = first {
            properties.insert("firstname".into(), json!(first));
        }
        if let Some(last) = last {
            properties.insert("lastname".into(), json!(last));
        }
        if let Some(title) = &record.title {
            properties.insert("jobtitle".into(), json!(title));
        }
        if let Some(phone) = &record.phone {
            properties.insert("phone".into(), json!(phone));
        }
        if let Some(company) = &record.company {
            properties.insert("company".into(), json!(company));
        }

        self.send(
            self.client
                .patch(format!(
                    "{}/crm/v3/objects/contacts/{}",
                    self.base_url, record.external_id
                ))
                .json(&json!({ "properties": properties })),
        )
        .await?;
        Ok(())
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent> {
        let kind = payload["subscriptionType"].as_str().unwrap_or_default();
        let external_id = payload["objectId"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| payload["objectId"].as_str().map(String::from))
            .ok_or_else(|| FlowError::BadRequest("webhook missing objectId".into()))?;
        Ok(match kind {
            "contact.propertyChange" | "contact.creation" => {
                WebhookEvent::ContactChanged { external_id }
            }
            "contact.deletion" => WebhookEvent::ContactDeleted { external_id },
            other => WebhookEvent::Unknown { kind: other.into() },
        })
    }
}
