use serde_json::{Value, json};

use leadflow_core::{Result, TaskClass};

use crate::linear::{LinearAgent, Prompt};

/// Scores an inbound lead 0-100 and buckets it into a tier. Routed to
/// the fast/cheap tier; a qualification verdict is latency-sensitive.
pub struct QualificationAgent;

impl LinearAgent for QualificationAgent {
    fn name(&self) -> &str {
        "qualification"
    }

    fn task(&self) -> TaskClass {
        TaskClass::Qualification
    }

    fn result_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["score", "tier", "rationale"],
            "properties": {
                "score": { "type": "integer", "minimum": 0, "maximum": 100 },
                "tier": { "type": "string", "enum": ["hot", "warm", "cold", "unqualified"] },
                "rationale": { "type": "string" },
            },
        }))
    }

    fn max_tokens(&self) -> u32 {
        512
    }

    fn build_prompt(&self, input: &Value) -> Result<Prompt> {
        let company = input["company_name"].as_str().unwrap_or("(unknown company)");
        let industry = input["industry"].as_str().unwrap_or("unknown");
        let size = input["company_size"].as_str().unwrap_or("unknown");
        let website = input["website"].as_str().unwrap_or("");
        let contact_title = input["contact_title"].as_str().unwrap_or("");

        Ok(Prompt {
            system: Some(
                "You are a B2B sales qualification analyst. Score how well a lead fits \
                 an AI-powered sales automation product sold to revenue teams. \
                 Reply with a single JSON object: score (0-100), tier (hot >= 80, \
                 warm >= 60, cold >= 35, else unqualified), rationale (2-3 sentences)."
                    .into(),
            ),
            user: format!(
                "Company: {company}\nIndustry: {industry}\nSize: {size}\n\
                 Website: {website}\nContact title: {contact_title}"
            ),
        })
    }

    fn postprocess(&self, raw: Value) -> Result<Value> {
        // Tier must agree with the score bands; the model occasionally
        // drifts, so the band is authoritative.
        let score = raw["score"].as_u64().unwrap_or(0);
        let tier = match score {
            80..=100 => "hot",
            60..=79 => "warm",
            35..=59 => "cold",
            _ => "unqualified",
        };
        Ok(json!({
            "score": score,
            "tier": tier,
            "rationale": raw["rationale"],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_bands_override_model_drift() {
        let agent = QualificationAgent;
        let out = agent
            .postprocess(json!({ "score": 85, "tier": "cold", "rationale": "fit" }))
            .unwrap();
        assert_eq!(out["tier"], "hot");
        assert_eq!(out["score"], 85);

        let out = agent
            .postprocess(json!({ "score": 10, "tier": "hot", "rationale": "none" }))
            .unwrap();
        assert_eq!(out["tier"], "unqualified");
    }

    #[test]
    fn prompt_carries_lead_fields() {
        let agent = QualificationAgent;
        let prompt = agent
            .build_prompt(&json!({
                "company_name": "Acme",
                "industry": "SaaS",
                "company_size": "50-200",
            }))
            .unwrap();
        assert!(prompt.user.contains("Acme"));
        assert!(prompt.user.contains("SaaS"));
        assert!(prompt.system.unwrap().contains("qualification"));
    }
}
