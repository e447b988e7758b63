use serde_json::{Value, json};

use leadflow_core::{Result, TaskClass};

use crate::linear::{LinearAgent, Prompt};

/// Drafts outbound copy for a qualified lead. Content generation is
/// quality-sensitive, so the task class routes to the high-quality tier.
pub struct MarketingAgent;

impl LinearAgent for MarketingAgent {
    fn name(&self) -> &str {
        "marketing"
    }

    fn task(&self) -> TaskClass {
        TaskClass::Marketing
    }

    fn result_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["subject", "body", "cta"],
            "properties": {
                "subject": { "type": "string" },
                "body": { "type": "string" },
                "cta": { "type": "string" },
                "personalization_notes": { "type": "string" },
            },
        }))
    }

    fn max_tokens(&self) -> u32 {
        2048
    }

    fn build_prompt(&self, input: &Value) -> Result<Prompt> {
        let company = input["company_name"].as_str().unwrap_or("(unknown)");
        let contact = input["contact_name"].as_str().unwrap_or("there");
        let title = input["contact_title"].as_str().unwrap_or("");
        let tier = input["tier"].as_str().unwrap_or("warm");
        let rationale = input["rationale"].as_str().unwrap_or("");

        Ok(Prompt {
            system: Some(
                "You write short, specific outbound emails for an AI sales automation \
                 product. No fluff, no buzzwords, one concrete observation about the \
                 prospect, one clear call to action. Reply with a single JSON object \
                 with subject, body, and cta."
                    .into(),
            ),
            user: format!(
                "Prospect: {contact} ({title}) at {company}\n\
                 Qualification tier: {tier}\nWhy they fit: {rationale}"
            ),
        })
    }
}
