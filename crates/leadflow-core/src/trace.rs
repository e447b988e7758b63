use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trace events emitted by the agent runtime. A sink is optional; its
/// absence never affects execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    NodeEnter {
        execution_id: Uuid,
        node: String,
        step: u32,
    },
    NodeExit {
        execution_id: Uuid,
        node: String,
        step: u32,
        outcome: String,
    },
    ToolCall {
        execution_id: Uuid,
        tool: String,
        success: bool,
        latency_ms: u64,
    },
    ProviderCall {
        execution_id: Uuid,
        provider: String,
        model: String,
        success: bool,
        latency_ms: u64,
    },
    ExecutionFinished {
        execution_id: Uuid,
        status: String,
        at: DateTime<Utc>,
    },
}

/// Receiver for trace events. Implementations must be cheap and must not
/// fail the execution.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Default sink: forwards to the `tracing` subscriber at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn emit(&self, event: TraceEvent) {
        tracing::debug!(event = ?event, "trace");
    }
}
