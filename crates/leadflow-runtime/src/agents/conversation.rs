use serde_json::{Value, json};

use leadflow_core::{Result, TaskClass};

use crate::linear::{LinearAgent, Prompt};

/// Free-text conversational turns with a prospect, streamed token by
/// token to the subscriber.
pub struct ConversationAgent;

impl LinearAgent for ConversationAgent {
    fn name(&self) -> &str {
        "conversation"
    }

    fn task(&self) -> TaskClass {
        TaskClass::Conversation
    }

    fn result_schema(&self) -> Option<Value> {
        None
    }

    fn streams(&self) -> bool {
        true
    }

    fn max_tokens(&self) -> u32 {
        1024
    }

    fn build_prompt(&self, input: &Value) -> Result<Prompt> {
        let user_input = input["user_input"].as_str().unwrap_or("");
        let history = input["history"]
            .as_array()
            .map(|turns| {
                turns
                    .iter()
                    .filter_map(|t| {
                        let role = t["role"].as_str()?;
                        let content = t["content"].as_str()?;
                        Some(format!("{role}: {content}"))
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let user = if history.is_empty() {
            user_input.to_string()
        } else {
            format!("{history}\nuser: {user_input}")
        };

        Ok(Prompt {
            system: Some(
                "You are a helpful sales development representative for an AI sales \
                 automation platform. Be concise and concrete; qualify interest \
                 without being pushy."
                    .into(),
            ),
            user,
        })
    }

    fn postprocess(&self, raw: Value) -> Result<Value> {
        Ok(json!({ "reply": raw["reply"] }))
    }
}
