use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a top-level agent invocation.
///
/// Exactly one terminal status (`Success` or `Failed`) is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One record per top-level agent invocation. The execution id doubles as
/// the stream id for correlation with chunks, logs, and traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: Uuid,
    /// Agent class, e.g. "qualification", "growth".
    pub agent: String,
    pub lead_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub cost_usd: f64,
    pub error: Option<String>,
}

impl AgentExecution {
    pub fn dispatched(agent: &str, lead_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            lead_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            latency_ms: None,
            cost_usd: 0.0,
            error: None,
        }
    }
}

/// Persisted graph state snapshot. One per (execution, step); the latest
/// step wins on resume. Checkpoints older than the configured TTL are
/// treated as absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: Uuid,
    pub step: u32,
    /// Opaque state blob (graph state or suspension payload).
    pub state: serde_json::Value,
    /// Set when a node suspended the execution for human input.
    pub suspended: Option<Suspension>,
    pub created_at: DateTime<Utc>,
}

/// Human-in-the-loop pause emitted by a graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspension {
    pub reason: String,
    pub payload: serde_json::Value,
    /// Node to re-enter on resume.
    pub resume_node: String,
}
