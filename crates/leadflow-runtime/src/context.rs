//! Shared execution context handed to graph nodes, linear agents, and
//! tools: the resilient provider client, the tool registry, the stream
//! sink, tracing, checkpoints, and the invocation's constraints.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use leadflow_core::{
    Checkpoint, ChunkBody, FlowError, Result, Suspension, TaskClass, TraceEvent, TraceSink,
};
use leadflow_llm::{Capability, GenerateRequest, Generation, ResilientClient, RouteQuery};
use leadflow_store::Repository;

use crate::schema::validate;
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

/// Where chunks produced by an execution go. The executor wires this to
/// the streaming fabric; tests and non-streaming paths use [`NullSink`].
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn emit(&self, body: ChunkBody) -> Result<()>;
}

pub struct NullSink;

#[async_trait]
impl ChunkSink for NullSink {
    async fn emit(&self, _body: ChunkBody) -> Result<()> {
        Ok(())
    }
}

/// Checkpoint persistence with the configured TTL applied on read.
pub struct CheckpointStore {
    repo: Arc<dyn Repository>,
    ttl: Duration,
}

impl CheckpointStore {
    pub fn new(repo: Arc<dyn Repository>, ttl: Duration) -> Self {
        Self { repo, ttl }
    }

    pub async fn put(
        &self,
        execution_id: Uuid,
        step: u32,
        state: Value,
        suspended: Option<Suspension>,
    ) -> Result<()> {
        self.repo
            .put_checkpoint(&Checkpoint {
                execution_id,
                step,
                state,
                suspended,
                created_at: chrono::Utc::now(),
            })
            .await
    }

    /// Latest checkpoint, ignoring any past the TTL.
    pub async fn latest(&self, execution_id: Uuid) -> Result<Option<Checkpoint>> {
        self.repo.latest_checkpoint(execution_id, self.ttl).await
    }

    pub async fn purge(&self) -> Result<u64> {
        self.repo.purge_checkpoints(self.ttl).await
    }
}

/// Routing constraints carried by one invocation.
#[derive(Debug, Clone, Default)]
pub struct RouteConstraints {
    pub max_latency_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub forced_provider: Option<String>,
    pub requires_vision: bool,
}

/// Per-execution context. Cheap to share; everything inside is an Arc.
pub struct NodeContext {
    pub client: Arc<ResilientClient>,
    pub tools: Arc<ToolRegistry>,
    pub sink: Arc<dyn ChunkSink>,
    pub trace_sink: Arc<dyn TraceSink>,
    pub cancel: CancellationToken,
    pub execution_id: Uuid,
    pub task: TaskClass,
    pub constraints: RouteConstraints,
    pub checkpoints: Arc<CheckpointStore>,
    /// Corrective reprompts allowed on structured-output validation
    /// failures before the call surfaces as a bad request.
    pub reprompt_attempts: u32,
    /// Running provider spend of this execution, written to its row.
    cost_usd: std::sync::Mutex<f64>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ResilientClient>,
        tools: Arc<ToolRegistry>,
        sink: Arc<dyn ChunkSink>,
        trace_sink: Arc<dyn TraceSink>,
        cancel: CancellationToken,
        execution_id: Uuid,
        task: TaskClass,
        constraints: RouteConstraints,
        checkpoints: Arc<CheckpointStore>,
        reprompt_attempts: u32,
    ) -> Self {
        Self {
            client,
            tools,
            sink,
            trace_sink,
            cancel,
            execution_id,
            task,
            constraints,
            checkpoints,
            reprompt_attempts,
            cost_usd: std::sync::Mutex::new(0.0),
        }
    }

    pub fn add_cost(&self, cost_usd: f64) {
        *self.cost_usd.lock().expect("cost lock") += cost_usd;
    }

    pub fn total_cost(&self) -> f64 {
        *self.cost_usd.lock().expect("cost lock")
    }

    pub fn route(&self) -> RouteQuery {
        let mut query = RouteQuery::for_task(self.task);
        query.max_latency_ms = self.constraints.max_latency_ms;
        query.max_cost_usd = self.constraints.max_cost_usd;
        query.forced_provider = self.constraints.forced_provider.clone();
        if self.constraints.requires_vision {
            query.required_capabilities.push(Capability::Vision);
        }
        query
    }

    pub fn trace(&self, event: TraceEvent) {
        self.trace_sink.emit(event);
    }

    pub async fn checkpoint(
        &self,
        step: u32,
        state: Value,
        suspended: Option<Suspension>,
    ) -> Result<()> {
        self.checkpoints
            .put(self.execution_id, step, state, suspended)
            .await
    }

    pub async fn emit(&self, body: ChunkBody) -> Result<()> {
        self.sink.emit(body).await
    }

    pub async fn emit_event(&self, name: &str, payload: Value) -> Result<()> {
        self.sink
            .emit(ChunkBody::Event {
                name: name.to_string(),
                payload,
            })
            .await
    }

    /// One routed provider call, traced.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let mut query = self.route();
        query.max_tokens = request.max_tokens;
        let started = Instant::now();
        let result = self.client.generate(&query, request).await;
        if let Ok(generation) = &result {
            self.add_cost(generation.cost_usd);
        }
        self.trace(TraceEvent::ProviderCall {
            execution_id: self.execution_id,
            provider: query
                .forced_provider
                .clone()
                .unwrap_or_else(|| self.task.as_str().to_string()),
            model: request.model.clone(),
            success: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    /// Routed provider call that must satisfy a result schema. Validation
    /// failures are retried with a corrective reprompt before the call is
    /// reported as a bad request.
    pub async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
    ) -> Result<Value> {
        let mut request = request.clone();
        request.response_schema = Some(schema.clone());
        let mut last_violation = String::new();

        for attempt in 0..=self.reprompt_attempts {
            if attempt > 0 {
                request.prompt = format!(
                    "{}\n\nYour previous reply was not valid: {last_violation}. \
                     Reply with a single JSON object matching the schema exactly.",
                    request.prompt
                );
            }
            let generation = self.generate(&request).await?;
            let parsed = match serde_json::from_str::<Value>(generation.content.trim()) {
                Ok(value) => value,
                Err(e) => {
                    last_violation = format!("not parseable JSON: {e}");
                    continue;
                }
            };
            match validate(&parsed, schema) {
                Ok(()) => return Ok(parsed),
                Err(violation) => last_violation = violation,
            }
        }
        Err(FlowError::StructuredOutput(last_violation))
    }

    /// Dispatch a tool call, traced, with the outcome surfaced as a chunk
    /// event for subscribers in event mode.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let tool_ctx = ToolContext {
            client: Arc::clone(&self.client),
            task: self.task,
        };
        let (outcome, latency_ms) = self.tools.dispatch(name, args, &tool_ctx).await?;
        self.trace(TraceEvent::ToolCall {
            execution_id: self.execution_id,
            tool: name.to_string(),
            success: !outcome.is_error(),
            latency_ms,
        });
        let _ = self
            .emit_event("tool_call", outcome.as_message(name))
            .await;
        Ok(outcome)
    }
}
