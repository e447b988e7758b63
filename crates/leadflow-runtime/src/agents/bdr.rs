use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

use leadflow_core::{Result, TaskClass};
use leadflow_llm::GenerateRequest;

use crate::graph::{END, GraphBuilder, GraphSpec, MergeRule, Node, NodeOutcome, StateDelta};
use crate::tools::{Tool, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};

/// Deterministic meeting-slot proposals: the next business days at
/// 10:00 and 14:00 UTC.
pub struct CalendarSlotsTool;

#[async_trait]
impl Tool for CalendarSlotsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calendar_slots".into(),
            description: "Propose open meeting slots over the next business days".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "days": { "type": "integer", "minimum": 1, "maximum": 10 },
                },
            }),
        }
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let days = args["days"].as_u64().unwrap_or(3) as i64;
        let mut slots = Vec::new();
        let mut day = Utc::now().date_naive();
        while (slots.len() as i64) < days * 2 {
            day += ChronoDuration::days(1);
            if matches!(day.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
                continue;
            }
            for hour in [10, 14] {
                slots.push(format!("{day}T{hour:02}:00:00Z"));
            }
        }
        Ok(json!({ "slots": slots }))
    }
}

/// BDR booking flow: parallel contact research and availability lookup,
/// a barrier where the outreach draft consumes both, and an approval
/// gate that suspends for a human unless auto-approval is on.
pub fn bdr_graph(tools: &ToolRegistry) -> Result<GraphSpec> {
    let intake = Node::new("intake", &["prospect"], Arc::new(|_ctx, state| {
        Box::pin(async move {
            let prospect = json!({
                "company": state.get("company_name").cloned().unwrap_or(Value::Null),
                "contact": state.get("contact_name").cloned().unwrap_or(Value::Null),
                "title": state.get("contact_title").cloned().unwrap_or(Value::Null),
            });
            Ok(NodeOutcome::Delta(StateDelta::new().set("prospect", prospect)))
        })
    }));

    let research_contact = Node::new("research_contact", &["notes", "signals"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let prospect = state.get("prospect").cloned().unwrap_or(Value::Null);
            let mut request = GenerateRequest::new(
                "",
                format!(
                    "Research this prospect before outreach: {prospect}. \
                     What should a BDR know, and which buying signals are visible?"
                ),
            );
            request.system = Some(
                "You prepare BDR call notes. Reply with a single JSON object: \
                 notes (array of short strings), signals (array of short strings)."
                    .into(),
            );
            request.max_tokens = 1024;

            let schema = json!({
                "type": "object",
                "required": ["notes", "signals"],
                "properties": {
                    "notes": { "type": "array", "items": { "type": "string" } },
                    "signals": { "type": "array", "items": { "type": "string" } },
                },
            });
            let value = ctx.generate_structured(&request, &schema).await?;
            Ok(NodeOutcome::Delta(
                StateDelta::new()
                    .set("notes", value["notes"].clone())
                    .set("signals", value["signals"].clone()),
            ))
        })
    }));

    let check_availability = Node::new("check_availability", &["slots", "signals"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let days = state.get("slot_days").cloned().unwrap_or(json!(3));
            let outcome = ctx
                .call_tool("calendar_slots", json!({ "days": days }))
                .await?;
            let slots = match outcome {
                ToolOutcome::Success(payload) => payload["slots"].clone(),
                ToolOutcome::Error(_) => json!([]),
            };
            Ok(NodeOutcome::Delta(
                StateDelta::new()
                    .set("slots", slots)
                    .set("signals", json!(["availability_checked"])),
            ))
        })
    }))
    .with_tools(&["calendar_slots"]);

    let draft_outreach = Node::new("draft_outreach", &["outreach"], Arc::new(|ctx, state| {
        Box::pin(async move {
            let prospect = state.get("prospect").cloned().unwrap_or(Value::Null);
            let notes = state.get("notes").cloned().unwrap_or(json!([]));
            let slots = state.get("slots").cloned().unwrap_or(json!([]));

            let mut request = GenerateRequest::new(
                "",
                format!(
                    "Draft a short booking email.\nProspect: {prospect}\n\
                     Notes: {notes}\nOffer two of these slots: {slots}"
                ),
            );
            request.system = Some(
                "You write BDR booking emails. Reply with a single JSON object: \
                 subject, body, proposed_times (array of ISO timestamps)."
                    .into(),
            );
            request.max_tokens = 1024;

            let schema = json!({
                "type": "object",
                "required": ["subject", "body", "proposed_times"],
                "properties": {
                    "subject": { "type": "string" },
                    "body": { "type": "string" },
                    "proposed_times": { "type": "array", "items": { "type": "string" } },
                },
            });
            let value = ctx.generate_structured(&request, &schema).await?;
            Ok(NodeOutcome::Delta(StateDelta::new().set("outreach", value)))
        })
    }));

    let approval_gate = Node::new("approval_gate", &["approved"], Arc::new(|_ctx, state| {
        Box::pin(async move {
            let auto = state
                .get("auto_approve")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let human = state
                .get("resume_input")
                .and_then(|v| v["approved"].as_bool())
                .unwrap_or(false);
            if auto || human {
                return Ok(NodeOutcome::Delta(
                    StateDelta::new().set("approved", json!(true)),
                ));
            }
            Ok(NodeOutcome::Suspend {
                reason: "outreach requires approval".into(),
                payload: state.get("outreach").cloned().unwrap_or(Value::Null),
            })
        })
    }));

    GraphBuilder::new("bdr", TaskClass::Bdr)
        .entry("intake")
        .node(intake)
        .node(research_contact)
        .node(check_availability)
        .node(draft_outreach)
        .node(approval_gate)
        .fan_out("intake", &["research_contact", "check_availability"])
        .edge("research_contact", "draft_outreach")
        .edge("check_availability", "draft_outreach")
        .edge("draft_outreach", "approval_gate")
        .edge("approval_gate", END)
        .merge_rule("signals", MergeRule::SetUnion)
        .merge_rule("notes", MergeRule::Append)
        .build(tools)
}
