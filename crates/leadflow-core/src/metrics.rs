use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latency distribution over a window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Per-provider slice of the realtime summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub calls: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub success_rate_pct: f64,
}

/// Denormalized 24-hour summary cached under `usage:realtime:last24h`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeMetrics {
    pub total_calls: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub success_rate_pct: f64,
    pub cache_hit_rate_pct: f64,
    pub latency: LatencyPercentiles,
    pub by_provider: HashMap<String, ProviderSummary>,
    pub computed_at: DateTime<Utc>,
}

/// Aggregation granularity for usage time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
    Month,
}

impl Interval {
    /// SQLite strftime pattern that buckets timestamps at this granularity.
    pub fn bucket_format(&self) -> &'static str {
        match self {
            Interval::Hour => "%Y-%m-%dT%H:00",
            Interval::Day => "%Y-%m-%d",
            Interval::Month => "%Y-%m",
        }
    }
}

/// One time-series bucket of usage aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBucket {
    pub bucket: String,
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub failures: u64,
}
