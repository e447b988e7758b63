use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse task category used by the router to pick provider defaults and
/// recorded on every audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Qualification,
    Enrichment,
    Growth,
    Marketing,
    Bdr,
    Conversation,
    Parsing,
    Vision,
    Embedding,
    #[default]
    Other,
}

impl TaskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::Qualification => "qualification",
            TaskClass::Enrichment => "enrichment",
            TaskClass::Growth => "growth",
            TaskClass::Marketing => "marketing",
            TaskClass::Bdr => "bdr",
            TaskClass::Conversation => "conversation",
            TaskClass::Parsing => "parsing",
            TaskClass::Vision => "vision",
            TaskClass::Embedding => "embedding",
            TaskClass::Other => "other",
        }
    }
}

impl std::str::FromStr for TaskClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "qualification" => Ok(TaskClass::Qualification),
            "enrichment" => Ok(TaskClass::Enrichment),
            "growth" => Ok(TaskClass::Growth),
            "marketing" => Ok(TaskClass::Marketing),
            "bdr" => Ok(TaskClass::Bdr),
            "conversation" => Ok(TaskClass::Conversation),
            "parsing" => Ok(TaskClass::Parsing),
            "vision" => Ok(TaskClass::Vision),
            "embedding" => Ok(TaskClass::Embedding),
            "other" => Ok(TaskClass::Other),
            other => Err(format!("unknown task class: {other}")),
        }
    }
}

/// Token counts for a single provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One immutable audit record per terminal provider call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallLog {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub operation: TaskClass,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub tenant_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiCallLog {
    /// Build a success row from a call's usage and timing.
    pub fn success(
        provider: &str,
        model: &str,
        endpoint: &str,
        operation: TaskClass,
        usage: TokenUsage,
        latency_ms: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            operation,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total(),
            latency_ms,
            cost_usd,
            tenant_id: None,
            success: true,
            error: None,
            cache_hit: false,
            created_at: Utc::now(),
        }
    }

    /// Build a failure row. Zero-token failures still produce a row.
    pub fn failure(
        provider: &str,
        model: &str,
        endpoint: &str,
        operation: TaskClass,
        usage: TokenUsage,
        latency_ms: u64,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            operation,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total(),
            latency_ms,
            cost_usd: 0.0,
            tenant_id: None,
            success: false,
            error: Some(error.to_string()),
            cache_hit: false,
            created_at: Utc::now(),
        }
    }
}

/// Write-side of the usage tracker. `record` must never block the caller's
/// critical path; implementations hand the row to a background writer.
pub trait UsageSink: Send + Sync {
    fn record(&self, log: ApiCallLog);
}

/// Sink that drops everything. Used where usage accounting is not wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullUsageSink;

impl UsageSink for NullUsageSink {
    fn record(&self, _log: ApiCallLog) {}
}
