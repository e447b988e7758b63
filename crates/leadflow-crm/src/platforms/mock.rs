//! Mock CRM platform for deterministic sync-engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use leadflow_config::ResetBoundary;
use leadflow_core::{FlowError, Result};

use crate::platform::{CrmPlatform, ExternalRecord, ListPage, RateBudget, SyncFilters, WebhookEvent};

pub struct MockPlatform {
    name: String,
    writable: bool,
    budget: RateBudget,
    page_size: usize,
    records: Mutex<Vec<ExternalRecord>>,
    /// external_id -> error code; listed records with a match fail upsert.
    upsert_failures: Mutex<HashMap<String, FailureKind>>,
    /// Fail the list call for this page index (0-based), once per entry.
    list_failures: Mutex<HashMap<usize, FailureKind>>,
    pub upserts: Mutex<Vec<ExternalRecord>>,
    pub list_calls: Mutex<u64>,
    list_delay: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Upstream,
    Timeout,
}

impl FailureKind {
    fn to_error(self) -> FlowError {
        match self {
            FailureKind::RateLimited => FlowError::RateLimited {
                retry_after_secs: None,
            },
            FailureKind::Upstream => FlowError::Upstream("mock upstream failure".into()),
            FailureKind::Timeout => FlowError::Timeout("mock timeout".into()),
        }
    }
}

impl MockPlatform {
    pub fn new(name: impl Into<String>, writable: bool) -> Self {
        Self {
            name: name.into(),
            writable,
            budget: RateBudget {
                calls: 1_000,
                boundary: ResetBoundary::Day,
            },
            page_size: 50,
            records: Mutex::new(Vec::new()),
            upsert_failures: Mutex::new(HashMap::new()),
            list_failures: Mutex::new(HashMap::new()),
            upserts: Mutex::new(Vec::new()),
            list_calls: Mutex::new(0),
            list_delay: None,
        }
    }

    /// Slow down list calls, so tests can observe an in-flight run.
    pub fn with_list_delay(mut self, delay: std::time::Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_budget(mut self, calls: u64) -> Self {
        self.budget.calls = calls;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_record(self, record: ExternalRecord) -> Self {
        self.records.lock().unwrap().push(record);
        self
    }

    pub fn fail_upsert(self, external_id: &str, kind: FailureKind) -> Self {
        self.upsert_failures
            .lock()
            .unwrap()
            .insert(external_id.to_string(), kind);
        self
    }

    pub fn fail_list_page(self, page: usize, kind: FailureKind) -> Self {
        self.list_failures.lock().unwrap().insert(page, kind);
        self
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }
}

/// Convenience builder for test records.
pub fn record(
    external_id: &str,
    email: Option<&str>,
    name: Option<&str>,
    updated_at: DateTime<Utc>,
) -> ExternalRecord {
    ExternalRecord {
        external_id: external_id.to_string(),
        email: email.map(String::from),
        name: name.map(String::from),
        title: None,
        phone: None,
        company: None,
        fields: Map::new(),
        updated_at,
    }
}

#[async_trait]
impl CrmPlatform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn rate_budget(&self) -> RateBudget {
        self.budget
    }

    async fn list(&self, _filters: &SyncFilters, cursor: Option<String>) -> Result<ListPage> {
        *self.list_calls.lock().unwrap() += 1;
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        let page: usize = cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0);

        if let Some(kind) = self.list_failures.lock().unwrap().remove(&page) {
            return Err(kind.to_error());
        }

        let records = self.records.lock().unwrap();
        let start = page * self.page_size;
        let slice: Vec<ExternalRecord> = records
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next_cursor =
            (start + slice.len() < records.len()).then(|| (page + 1).to_string());
        Ok(ListPage {
            records: slice,
            next_cursor,
            rate_limit_remaining: None,
        })
    }

    async fn get(&self, external_id: &str) -> Result<Option<ExternalRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_id == external_id)
            .cloned())
    }

    async fn upsert(&self, record: &ExternalRecord) -> Result<()> {
        if !self.writable {
            return Err(FlowError::BadRequest(format!(
                "{} is read-only",
                self.name
            )));
        }
        if let Some(kind) = self
            .upsert_failures
            .lock()
            .unwrap()
            .get(&record.external_id)
            .copied()
        {
            return Err(kind.to_error());
        }
        self.upserts.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent> {
        match payload["external_id"].as_str() {
            Some(id) => Ok(WebhookEvent::ContactChanged {
                external_id: id.to_string(),
            }),
            None => Ok(WebhookEvent::Unknown { kind: "mock".into() }),
        }
    }
}
