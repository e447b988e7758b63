//! Linear agents: a fixed `preprocess → prompt build → provider call →
//! postprocess` pipeline against a typed result schema, or a streaming
//! free-text call for conversational agents.

use async_trait::async_trait;
use serde_json::{Value, json};

use leadflow_core::{ChunkBody, FlowError, Result, TaskClass};
use leadflow_llm::{GenerateRequest, TokenChunk};

use crate::context::NodeContext;

pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

/// A single-call agent with a typed result.
#[async_trait]
pub trait LinearAgent: Send + Sync {
    fn name(&self) -> &str;

    fn task(&self) -> TaskClass;

    /// Schema the provider's reply must satisfy. `None` means free text
    /// (conversational agents).
    fn result_schema(&self) -> Option<Value>;

    /// Whether output should stream token-by-token. Only meaningful
    /// without a result schema.
    fn streams(&self) -> bool {
        false
    }

    fn max_tokens(&self) -> u32 {
        1024
    }

    fn preprocess(&self, input: &Value) -> Result<Value> {
        Ok(input.clone())
    }

    fn build_prompt(&self, input: &Value) -> Result<Prompt>;

    fn postprocess(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }
}

/// Run a linear agent to completion.
pub async fn run_linear(
    agent: &dyn LinearAgent,
    ctx: &NodeContext,
    input: &Value,
) -> Result<Value> {
    let input = agent.preprocess(input)?;
    let prompt = agent.build_prompt(&input)?;

    let mut request = GenerateRequest::new("", prompt.user);
    request.system = prompt.system;
    request.max_tokens = agent.max_tokens();

    match agent.result_schema() {
        Some(schema) => {
            let value = ctx.generate_structured(&request, &schema).await?;
            agent.postprocess(value)
        }
        None if agent.streams() => {
            let reply = stream_reply(ctx, &request).await?;
            agent.postprocess(json!({ "reply": reply }))
        }
        None => {
            let generation = ctx.generate(&request).await?;
            agent.postprocess(json!({ "reply": generation.content }))
        }
    }
}

/// Stream a free-text reply through the chunk sink, honoring
/// cancellation between chunks (the next safe point).
async fn stream_reply(ctx: &NodeContext, request: &GenerateRequest) -> Result<String> {
    let mut query = ctx.route();
    query.max_tokens = request.max_tokens;
    let mut rx = ctx.client.generate_stream(&query, request).await?;

    let mut reply = String::new();
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(FlowError::Cancelled),
            chunk = rx.recv() => chunk,
        };
        match chunk {
            Some(TokenChunk::Token(text)) => {
                reply.push_str(&text);
                ctx.emit(ChunkBody::Token { text }).await?;
            }
            Some(TokenChunk::Usage { cost_usd, .. }) => ctx.add_cost(cost_usd),
            Some(TokenChunk::End) | None => break,
            Some(TokenChunk::Error(e)) => return Err(e),
        }
    }
    Ok(reply.trim().to_string())
}
