use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use leadflow_config::ResetBoundary;
use leadflow_core::Result;

/// One record as seen on the external platform, normalized to the
/// engine's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

/// One page of external records.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub records: Vec<ExternalRecord>,
    pub next_cursor: Option<String>,
    /// Remaining calls as reported by the platform, when it says.
    pub rate_limit_remaining: Option<u64>,
}

/// Record selection for a sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncFilters {
    /// Only records modified after this instant.
    pub modified_since: Option<DateTime<Utc>>,
    /// Platform-specific list/segment identifier.
    pub list_id: Option<String>,
    /// Page size hint.
    pub page_size: Option<u32>,
}

/// Declared call budget and its reset boundary.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    pub calls: u64,
    pub boundary: ResetBoundary,
}

/// A parsed inbound webhook.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    ContactChanged { external_id: String },
    ContactDeleted { external_id: String },
    Unknown { kind: String },
}

/// Adapter over one external contact platform. Capability-tagged:
/// `upsert` on a platform that is not `writable()` is a bad request,
/// rejected before any network call.
#[async_trait]
pub trait CrmPlatform: Send + Sync {
    /// Stable platform tag, e.g. "hubspot".
    fn name(&self) -> &str;

    /// Whether the platform accepts writes.
    fn writable(&self) -> bool;

    fn rate_budget(&self) -> RateBudget;

    /// One page of records matching the filters.
    async fn list(&self, filters: &SyncFilters, cursor: Option<String>) -> Result<ListPage>;

    async fn get(&self, external_id: &str) -> Result<Option<ExternalRecord>>;

    /// Create or update a record. Only on writable platforms.
    async fn upsert(&self, record: &ExternalRecord) -> Result<()>;

    /// Parse a platform webhook payload into an event.
    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent>;
}
