//! Execution surface for all agents: lifecycle rows, deadlines and
//! cancellation, stream publication, checkpoint-based resume.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use leadflow_config::AgentsConfig;
use leadflow_core::{
    AgentExecution, Checkpoint, Chunk, ChunkBody, ExecutionStatus, FlowError, Result, StreamMode,
    Suspension, TraceEvent, TraceSink,
};
use leadflow_llm::ResilientClient;
use leadflow_store::Repository;
use leadflow_stream::StreamFabric;

use crate::context::{ChunkSink, CheckpointStore, NodeContext, RouteConstraints};
use crate::graph::{GraphRunOutcome, GraphSpec, GraphState, parse_checkpoint_blob};
use crate::linear::{LinearAgent, run_linear};
use crate::schema::validate;
use crate::tools::ToolRegistry;

/// The two agent shapes behind one execution surface.
#[derive(Clone)]
pub enum AgentKind {
    Linear(Arc<dyn LinearAgent>),
    Graph(Arc<GraphSpec>),
}

impl AgentKind {
    fn task(&self) -> leadflow_core::TaskClass {
        match self {
            AgentKind::Linear(agent) => agent.task(),
            AgentKind::Graph(spec) => spec.task,
        }
    }
}

/// Options recognized on every invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub max_latency_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub forced_provider: Option<String>,
    pub deadline_ms: Option<u64>,
    /// Resume this execution from its latest checkpoint.
    pub checkpoint_id: Option<Uuid>,
    pub requires_vision: bool,
    /// Extra schema the final result must satisfy.
    pub structured_output_schema: Option<Value>,
    pub stream_mode: StreamMode,
    pub lead_id: Option<Uuid>,
}

/// Outcome of one invocation.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub suspended: Option<Suspension>,
}

/// Latest known state of an execution.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution: AgentExecution,
    pub checkpoint: Option<Checkpoint>,
}

enum BodyOutcome {
    Done(Value),
    Suspended(Suspension),
}

/// Fabric-backed chunk sink, filtered by the subscriber's stream mode.
struct FabricSink {
    fabric: Arc<StreamFabric>,
    stream_id: Uuid,
    mode: StreamMode,
}

#[async_trait]
impl ChunkSink for FabricSink {
    async fn emit(&self, body: ChunkBody) -> Result<()> {
        let deliver = match (&body, self.mode) {
            (ChunkBody::Token { .. }, StreamMode::Tokens | StreamMode::Events) => true,
            (ChunkBody::Token { .. }, StreamMode::Messages) => false,
            (ChunkBody::Event { .. }, StreamMode::Events) => true,
            (ChunkBody::Event { .. }, _) => false,
            // Terminals are published by the executor, not the sink.
            _ => true,
        };
        if deliver {
            self.fabric.publish(self.stream_id, body).await?;
        }
        Ok(())
    }
}

/// The agent runtime: registered agents plus everything an execution
/// needs, injected.
pub struct AgentRuntime {
    agents: HashMap<String, AgentKind>,
    client: Arc<ResilientClient>,
    tools: Arc<ToolRegistry>,
    repo: Arc<dyn Repository>,
    fabric: Arc<StreamFabric>,
    checkpoints: Arc<CheckpointStore>,
    trace: Arc<dyn TraceSink>,
    config: AgentsConfig,
}

impl AgentRuntime {
    pub fn new(
        client: Arc<ResilientClient>,
        tools: Arc<ToolRegistry>,
        repo: Arc<dyn Repository>,
        fabric: Arc<StreamFabric>,
        trace: Arc<dyn TraceSink>,
        config: AgentsConfig,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointStore::new(
            Arc::clone(&repo),
            Duration::from_secs(config.checkpoint_ttl_hours * 3600),
        ));
        Self {
            agents: HashMap::new(),
            client,
            tools,
            repo,
            fabric,
            checkpoints,
            trace,
            config,
        }
    }

    pub fn register_agent(&mut self, name: &str, kind: AgentKind) {
        self.agents.insert(name.to_string(), kind);
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn fabric(&self) -> &Arc<StreamFabric> {
        &self.fabric
    }

    /// Run an agent to completion (or suspension) and return the result.
    pub async fn invoke_agent(
        &self,
        agent: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<InvokeResult> {
        let kind = self
            .agents
            .get(agent)
            .cloned()
            .ok_or_else(|| FlowError::AgentNotFound(agent.to_string()))?;
        let execution_id = options.checkpoint_id.unwrap_or_else(Uuid::new_v4);
        let cancel = self.fabric.open(execution_id);
        self.execute(agent, kind, execution_id, cancel, input, options, None)
            .await
    }

    /// Start an agent and return its stream id plus a subscription that
    /// is attached before the first chunk is published.
    pub async fn stream_agent(
        self: &Arc<Self>,
        agent: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<(Uuid, mpsc::Receiver<Chunk>)> {
        let kind = self
            .agents
            .get(agent)
            .cloned()
            .ok_or_else(|| FlowError::AgentNotFound(agent.to_string()))?;
        let execution_id = options.checkpoint_id.unwrap_or_else(Uuid::new_v4);
        let cancel = self.fabric.open(execution_id);
        let rx = self.fabric.subscribe(execution_id).await?;

        let runtime = Arc::clone(self);
        let agent = agent.to_string();
        tokio::spawn(async move {
            if let Err(e) = runtime
                .execute(&agent, kind, execution_id, cancel, input, options, None)
                .await
            {
                // Terminal bookkeeping already happened inside execute.
                warn!(%execution_id, error = %e, "streamed execution failed");
            }
        });
        Ok((execution_id, rx))
    }

    /// Resume a suspended execution with human input.
    pub async fn resume(&self, execution_id: Uuid, input: Value) -> Result<InvokeResult> {
        let execution = self
            .repo
            .get_execution(execution_id)
            .await?
            .ok_or(FlowError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(FlowError::BadRequest(format!(
                "execution {execution_id} already ended as {}",
                execution.status.as_str()
            )));
        }
        let kind = self
            .agents
            .get(&execution.agent)
            .cloned()
            .ok_or_else(|| FlowError::AgentNotFound(execution.agent.clone()))?;

        let cancel = self.fabric.open(execution_id);
        let mut options = InvokeOptions {
            checkpoint_id: Some(execution_id),
            ..Default::default()
        };
        options.lead_id = execution.lead_id;
        self.execute(
            &execution.agent,
            kind,
            execution_id,
            cancel,
            Value::Null,
            options,
            Some(input),
        )
        .await
    }

    /// Latest checkpoint or terminal status.
    pub async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState> {
        let execution = self
            .repo
            .get_execution(execution_id)
            .await?
            .ok_or(FlowError::ExecutionNotFound(execution_id))?;
        let checkpoint = self.checkpoints.latest(execution_id).await?;
        Ok(ExecutionState {
            execution,
            checkpoint,
        })
    }

    /// Cancel a running execution via its stream id.
    pub fn cancel(&self, stream_id: Uuid) -> Result<()> {
        self.fabric.cancel(stream_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        agent: &str,
        kind: AgentKind,
        execution_id: Uuid,
        cancel: CancellationToken,
        input: Value,
        options: InvokeOptions,
        resume_input: Option<Value>,
    ) -> Result<InvokeResult> {
        // One execution row per id; resumption reuses the existing row.
        let mut execution = match self.repo.get_execution(execution_id).await? {
            Some(existing) => existing,
            None => {
                let mut fresh = AgentExecution::dispatched(agent, options.lead_id);
                fresh.id = execution_id;
                self.repo.insert_execution(&fresh).await?;
                fresh
            }
        };
        execution.status = ExecutionStatus::Running;
        self.repo.update_execution(&execution).await?;

        let sink: Arc<dyn ChunkSink> = Arc::new(FabricSink {
            fabric: Arc::clone(&self.fabric),
            stream_id: execution_id,
            mode: options.stream_mode,
        });
        let ctx = NodeContext::new(
            Arc::clone(&self.client),
            Arc::clone(&self.tools),
            sink,
            Arc::clone(&self.trace),
            cancel.clone(),
            execution_id,
            kind.task(),
            RouteConstraints {
                max_latency_ms: options.max_latency_ms,
                max_cost_usd: options.max_cost_usd,
                forced_provider: options.forced_provider.clone(),
                requires_vision: options.requires_vision,
            },
            Arc::clone(&self.checkpoints),
            self.config.reprompt_attempts,
        );

        let deadline = options
            .deadline_ms
            .map(Duration::from_millis)
            .or_else(|| {
                (self.config.default_deadline_secs > 0)
                    .then(|| Duration::from_secs(self.config.default_deadline_secs))
            });

        let body = self.run_body(&kind, &ctx, &input, resume_input, &options);
        let outcome = {
            let bounded = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, body).await {
                        Ok(result) => result,
                        Err(_) => Err(FlowError::DeadlineExceeded),
                    },
                    None => body.await,
                }
            };
            tokio::select! {
                result = bounded => result,
                _ = cancel.cancelled() => Err(FlowError::Cancelled),
            }
        };

        execution.cost_usd = ctx.total_cost();
        match outcome {
            Ok(BodyOutcome::Done(result)) => {
                self.fabric
                    .publish(
                        execution_id,
                        ChunkBody::Complete {
                            result: result.clone(),
                        },
                    )
                    .await?;
                self.finish(&mut execution, ExecutionStatus::Success, None)
                    .await;
                Ok(InvokeResult {
                    execution_id,
                    status: ExecutionStatus::Success,
                    result: Some(result),
                    suspended: None,
                })
            }
            Ok(BodyOutcome::Suspended(suspension)) => {
                // The execution stays alive; this invocation's stream
                // closes with the suspension surfaced to the subscriber.
                self.fabric
                    .publish(
                        execution_id,
                        ChunkBody::Complete {
                            result: json!({
                                "suspended": true,
                                "reason": suspension.reason,
                                "payload": suspension.payload,
                            }),
                        },
                    )
                    .await?;
                info!(%execution_id, reason = %suspension.reason, "execution suspended");
                Ok(InvokeResult {
                    execution_id,
                    status: ExecutionStatus::Running,
                    result: None,
                    suspended: Some(suspension),
                })
            }
            Err(e) => {
                let _ = self
                    .fabric
                    .publish(
                        execution_id,
                        ChunkBody::Error {
                            code: e.code().into(),
                            message: e.to_string(),
                        },
                    )
                    .await;
                self.finish(&mut execution, ExecutionStatus::Failed, Some(e.code()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_body(
        &self,
        kind: &AgentKind,
        ctx: &NodeContext,
        input: &Value,
        resume_input: Option<Value>,
        options: &InvokeOptions,
    ) -> Result<BodyOutcome> {
        match kind {
            AgentKind::Linear(agent) => {
                let result = run_linear(agent.as_ref(), ctx, input).await?;
                if let Some(schema) = &options.structured_output_schema
                    && let Err(violation) = validate(&result, schema)
                {
                    return Err(FlowError::StructuredOutput(violation));
                }
                Ok(BodyOutcome::Done(result))
            }
            AgentKind::Graph(spec) => {
                let checkpoint = self.checkpoints.latest(ctx.execution_id).await?;
                let (mut state, frontier, start_step) = match checkpoint {
                    Some(checkpoint) => {
                        let (state, mut frontier) = parse_checkpoint_blob(&checkpoint.state);
                        if let Some(suspension) = &checkpoint.suspended {
                            frontier = vec![suspension.resume_node.clone()];
                        }
                        if frontier.is_empty() {
                            frontier = vec![spec.entry_node().to_string()];
                        }
                        (state, frontier, checkpoint.step)
                    }
                    None => (
                        GraphState::from_value(input.clone()),
                        vec![spec.entry_node().to_string()],
                        0,
                    ),
                };
                if let Some(resume_input) = resume_input {
                    state.set("resume_input", resume_input);
                }

                match spec
                    .run(ctx, state, frontier, start_step, self.config.max_steps)
                    .await?
                {
                    GraphRunOutcome::Finished(state) => Ok(BodyOutcome::Done(state.to_value())),
                    GraphRunOutcome::Suspended { suspension, .. } => {
                        Ok(BodyOutcome::Suspended(suspension))
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        execution: &mut AgentExecution,
        status: ExecutionStatus,
        error: Option<&str>,
    ) {
        execution.status = status;
        execution.ended_at = Some(Utc::now());
        execution.latency_ms = Some(
            (Utc::now() - execution.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        execution.error = error.map(String::from);
        match self.repo.update_execution(execution).await {
            Ok(true) => {}
            Ok(false) => warn!(id = %execution.id, "terminal status already written, keeping first"),
            Err(e) => warn!(id = %execution.id, error = %e, "failed to finalize execution"),
        }
        self.trace.emit(TraceEvent::ExecutionFinished {
            execution_id: execution.id,
            status: status.as_str().into(),
            at: Utc::now(),
        });
    }
}
