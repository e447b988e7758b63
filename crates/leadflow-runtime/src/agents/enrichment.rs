use serde_json::{Value, json};

use leadflow_core::{Result, TaskClass};

use crate::linear::{LinearAgent, Prompt};

/// Fills in what qualification skipped: above-the-line contacts, a
/// company summary, and visible tooling. Output lands in the lead's
/// `additional_data` for later stages.
pub struct EnrichmentAgent;

impl LinearAgent for EnrichmentAgent {
    fn name(&self) -> &str {
        "enrichment"
    }

    fn task(&self) -> TaskClass {
        TaskClass::Enrichment
    }

    fn result_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["company_summary", "atl_contacts"],
            "properties": {
                "company_summary": { "type": "string" },
                "atl_contacts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "title"],
                        "properties": {
                            "name": { "type": "string" },
                            "title": { "type": "string" },
                            "profile_url": { "type": "string" },
                        },
                    },
                },
                "tech_stack": { "type": "array", "items": { "type": "string" } },
            },
        }))
    }

    fn max_tokens(&self) -> u32 {
        2048
    }

    fn build_prompt(&self, input: &Value) -> Result<Prompt> {
        let company = input["company_name"].as_str().unwrap_or("(unknown)");
        let website = input["website"].as_str().unwrap_or("");
        let industry = input["industry"].as_str().unwrap_or("");
        let notes = input["notes"].as_str().unwrap_or("");

        Ok(Prompt {
            system: Some(
                "You are a sales research assistant. Given a target company, produce \
                 a concise company summary, likely above-the-line decision makers \
                 (VP+ in sales, revenue, or growth), and any tooling visible from \
                 public signals. Reply with a single JSON object."
                    .into(),
            ),
            user: format!(
                "Company: {company}\nWebsite: {website}\nIndustry: {industry}\nNotes: {notes}"
            ),
        })
    }
}
