//! Tool registry: a closed set of named, typed functions routed by name.
//! Unknown tools referenced by a graph are a compile error; at runtime a
//! tool call validates its arguments, runs through the same resilience
//! stack as any provider call, and yields a `ToolOutcome`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use leadflow_core::{FlowError, Result, TaskClass};
use leadflow_llm::{ResilientClient, RouteQuery};

use crate::schema::validate;

/// Declared identity and input contract of a tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub input_schema: Value,
}

/// Result of one tool call, appended to the message history under the
/// tool role so the model can reason over it on its next turn.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }

    /// Message-history entry for this outcome.
    pub fn as_message(&self, tool: &str) -> Value {
        match self {
            ToolOutcome::Success(payload) => serde_json::json!({
                "role": "tool",
                "tool": tool,
                "content": payload,
            }),
            ToolOutcome::Error(reason) => serde_json::json!({
                "role": "tool",
                "tool": tool,
                "error": reason,
            }),
        }
    }
}

/// Everything a tool may need: provider-backed tools go through the
/// resilient client like any other call.
pub struct ToolContext {
    pub client: Arc<ResilientClient>,
    pub task: TaskClass,
}

impl ToolContext {
    pub fn route(&self) -> RouteQuery {
        RouteQuery::for_task(self.task)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// The closed tool set. Introspection happens at graph-compile time;
/// dispatch is by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.spec().name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    /// Validate arguments and run the tool. Tool failures become
    /// `ToolOutcome::Error`, not a crashed execution; only an unknown
    /// tool name is a hard error.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<(ToolOutcome, u64)> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;

        let started = Instant::now();
        if let Err(violation) = validate(&args, &tool.spec().input_schema) {
            return Ok((
                ToolOutcome::Error(format!("invalid arguments: {violation}")),
                started.elapsed().as_millis() as u64,
            ));
        }

        let outcome = match tool.invoke(args, ctx).await {
            Ok(payload) => ToolOutcome::Success(payload),
            Err(e) => ToolOutcome::Error(e.to_string()),
        };
        Ok((outcome, started.elapsed().as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_config::{BreakerConfig, RouterConfig};
    use leadflow_core::NullUsageSink;
    use leadflow_llm::{BreakerRegistry, HealthTracker, ProviderRouter, RetryPolicy};
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "echo the message back".into(),
                input_schema: json!({
                    "type": "object",
                    "required": ["message"],
                    "properties": { "message": { "type": "string" } },
                }),
            }
        }

        async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({ "echoed": args["message"] }))
        }
    }

    fn ctx() -> ToolContext {
        let breakers = Arc::new(BreakerRegistry::new(&BreakerConfig::default()));
        let health = Arc::new(HealthTracker::new());
        let router = ProviderRouter::new(
            &RouterConfig::default(),
            Arc::clone(&breakers),
            Arc::clone(&health),
        );
        ToolContext {
            client: Arc::new(ResilientClient::new(
                router,
                breakers,
                health,
                RetryPolicy::default(),
                Arc::new(NullUsageSink),
            )),
            task: TaskClass::Other,
        }
    }

    #[tokio::test]
    async fn dispatch_validates_and_runs() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let (outcome, _) = registry
            .dispatch("echo", json!({ "message": "hi" }), &ctx())
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Success(payload) => assert_eq!(payload["echoed"], "hi"),
            ToolOutcome::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn bad_arguments_are_a_tool_error_not_a_crash() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let (outcome, _) = registry
            .dispatch("echo", json!({ "wrong": 1 }), &ctx())
            .await
            .unwrap();
        assert!(outcome.is_error());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_hard_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .dispatch("nope", json!({}), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tool_error");
    }
}
