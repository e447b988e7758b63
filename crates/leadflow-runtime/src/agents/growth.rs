use serde_json::json;
use std::sync::Arc;

use leadflow_core::{Result, TaskClass};
use leadflow_llm::GenerateRequest;

use crate::graph::{END, GraphBuilder, GraphSpec, MergeRule, Node, NodeOutcome, StateDelta};
use crate::tools::ToolRegistry;

/// Default confidence bar for leaving the research loop.
const CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Growth analysis as a cyclic graph: research accumulates insights,
/// validate scores them, and the loop repeats until confidence clears
/// the bar (or the step cap ends the run with whatever was gathered).
pub fn growth_graph(tools: &ToolRegistry) -> Result<GraphSpec> {
    let research = Node::new("research", &["insights", "confidence"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let company = state
                .get("company_name")
                .and_then(|v| v.as_str())
                .unwrap_or("(unknown)")
                .to_string();
            let prior = state
                .get("insights")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);

            let mut request = GenerateRequest::new(
                "",
                format!(
                    "Research growth signals for {company}. {prior} insights gathered so far; \
                     find new ones (hiring, funding, product launches, market moves). \
                     Estimate your confidence that the picture is complete."
                ),
            );
            request.system = Some(
                "You are a growth analyst. Reply with a single JSON object: \
                 insights (array of short strings), confidence (0 to 1)."
                    .into(),
            );
            request.max_tokens = 1024;

            let schema = json!({
                "type": "object",
                "required": ["insights", "confidence"],
                "properties": {
                    "insights": { "type": "array", "items": { "type": "string" } },
                    "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                },
            });
            let value = ctx.generate_structured(&request, &schema).await?;

            Ok(NodeOutcome::Delta(
                StateDelta::new()
                    .set("insights", value["insights"].clone())
                    .set("confidence", value["confidence"].clone()),
            ))
        })
    }));

    let validate = Node::new("validate", &["confidence"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let insights = state.get("insights").cloned().unwrap_or(json!([]));
            let mut request = GenerateRequest::new(
                "",
                format!(
                    "Review these growth insights and score how complete and well-supported \
                     they are as a basis for an account plan:\n{insights}"
                ),
            );
            request.system = Some(
                "You are a skeptical reviewer. Reply with a single JSON object: \
                 confidence (0 to 1)."
                    .into(),
            );
            request.max_tokens = 256;

            let schema = json!({
                "type": "object",
                "required": ["confidence"],
                "properties": {
                    "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                },
            });
            let value = ctx.generate_structured(&request, &schema).await?;
            Ok(NodeOutcome::Delta(
                StateDelta::new().set("confidence", value["confidence"].clone()),
            ))
        })
    }));

    let synthesize = Node::new("synthesize", &["report"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let insights = state.get("insights").cloned().unwrap_or(json!([]));
            let company = state
                .get("company_name")
                .and_then(|v| v.as_str())
                .unwrap_or("(unknown)")
                .to_string();

            let mut request = GenerateRequest::new(
                "",
                format!("Write a growth account brief for {company} from these insights:\n{insights}"),
            );
            request.system = Some(
                "You are a growth analyst. Reply with a single JSON object: \
                 report (a markdown brief)."
                    .into(),
            );
            request.max_tokens = 2048;

            let schema = json!({
                "type": "object",
                "required": ["report"],
                "properties": { "report": { "type": "string" } },
            });
            let value = ctx.generate_structured(&request, &schema).await?;
            Ok(NodeOutcome::Delta(
                StateDelta::new().set("report", value["report"].clone()),
            ))
        })
    }));

    GraphBuilder::new("growth", TaskClass::Growth)
        .entry("research")
        .node(research)
        .node(validate)
        .node(synthesize)
        .edge("research", "validate")
        .conditional_edge("validate", &["research", "synthesize"], |state| {
            let threshold = state
                .number("confidence_threshold")
                .unwrap_or(CONFIDENCE_THRESHOLD);
            if state.number("confidence").unwrap_or(0.0) >= threshold {
                "synthesize".to_string()
            } else {
                "research".to_string()
            }
        })
        .edge("synthesize", END)
        .merge_rule("insights", MergeRule::Append)
        .merge_rule("confidence", MergeRule::Replace)
        .build(tools)
}
