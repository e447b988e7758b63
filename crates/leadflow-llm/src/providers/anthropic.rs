use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use leadflow_core::{FlowError, Result, TokenUsage};

use crate::pricing::PricingRule;
use crate::provider::{Capability, GenerateRequest, Generation, LlmProvider, TokenChunk};

/// High-quality tier. The only provider advertising vision; also the
/// only one with prompt caching.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

static PRICING: Lazy<HashMap<&'static str, PricingRule>> = Lazy::new(|| {
    HashMap::from([
        (
            "claude-sonnet-4-20250514",
            PricingRule::PerTokenSplit {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        ),
        (
            "claude-opus-4-20250514",
            PricingRule::PerTokenSplit {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
            },
        ),
        (
            "claude-haiku-3-5",
            PricingRule::PerTokenSplit {
                input_per_mtok: 0.80,
                output_per_mtok: 4.0,
            },
        ),
    ])
});

const CAPABILITIES: &[Capability] = &[
    Capability::Vision,
    Capability::Streaming,
    Capability::LongContext,
    Capability::PromptCaching,
];

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, default_model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com/v1".into()),
            default_model,
        }
    }

    fn build_body(&self, request: &GenerateRequest, stream: bool) -> Value {
        let user_content = match &request.image {
            Some(image) => json!([
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.media_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(&image.data),
                    },
                },
                { "type": "text", "text": request.prompt },
            ]),
            None => json!(request.prompt),
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": user_content }],
        });
        // No request-side schema enforcement on this API; steer the model
        // and let the caller validate on parse.
        let mut system = request.system.clone();
        if let Some(schema) = &request.response_schema {
            let hint = format!(
                "Respond with a single JSON object matching this schema, no prose:\n{schema}"
            );
            system = Some(match system {
                Some(s) => format!("{s}\n\n{hint}"),
                None => hint,
            });
        }
        if let Some(system) = &system {
            if request.enable_caching {
                body["system"] = json!([{
                    "type": "text",
                    "text": system,
                    "cache_control": { "type": "ephemeral" },
                }]);
            } else {
                body["system"] = json!(system);
            }
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn map_error(status: u16, retry_after: Option<u64>, body: &str) -> FlowError {
        match status {
            401 | 403 => FlowError::Auth(format!("HTTP {status}: {body}")),
            400 | 404 | 422 => FlowError::BadRequest(format!("HTTP {status}: {body}")),
            429 => FlowError::RateLimited {
                retry_after_secs: retry_after,
            },
            529 => FlowError::Upstream(format!("HTTP {status}: overloaded")),
            _ => FlowError::Upstream(format!("HTTP {status}: {body}")),
        }
    }

    fn map_transport(e: reqwest::Error) -> FlowError {
        if e.is_timeout() {
            FlowError::Timeout(e.to_string())
        } else {
            FlowError::Upstream(e.to_string())
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn endpoint(&self) -> &str {
        "/messages"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn pricing(&self, model: &str) -> PricingRule {
        PRICING
            .get(model)
            .copied()
            .unwrap_or(PRICING["claude-sonnet-4-20250514"])
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let body = self.build_body(request, false);
        debug!(model = %request.model, "sending Anthropic API request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_error(status, retry_after, &text));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;

        let content = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        if b["type"] == "text" {
                            b["text"].as_str().map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| FlowError::Protocol("response missing content blocks".into()))?;

        let usage = TokenUsage {
            prompt_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        };
        let cache_hit = data["usage"]["cache_read_input_tokens"]
            .as_u64()
            .unwrap_or(0)
            > 0;

        Ok(Generation {
            content,
            usage,
            cost_usd: self.pricing(&request.model).cost(usage),
            model: request.model.clone(),
            cache_hit,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        let body = self.build_body(request, true);
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let pricing = self.pricing(&request.model);

        tokio::spawn(async move {
            let resp = match client
                .post(format!("{base_url}/messages"))
                .header("x-api-key", &api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx.send(TokenChunk::Error(Self::map_transport(e))).await;
                    return;
                }
            };
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let _ = tx
                    .send(TokenChunk::Error(Self::map_error(status, None, &text)))
                    .await;
                return;
            }

            use futures::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut stopped = false;

            while let Some(chunk_result) = stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(TokenChunk::Error(Self::map_transport(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };

                    match event["type"].as_str() {
                        Some("message_start") => {
                            usage.prompt_tokens = event["message"]["usage"]["input_tokens"]
                                .as_u64()
                                .unwrap_or(0)
                                as u32;
                        }
                        Some("content_block_delta") => {
                            if let Some(text) = event["delta"]["text"].as_str()
                                && tx.send(TokenChunk::Token(text.to_string())).await.is_err()
                            {
                                return;
                            }
                        }
                        Some("message_delta") => {
                            if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                                usage.completion_tokens = out as u32;
                            }
                        }
                        Some("message_stop") => {
                            stopped = true;
                        }
                        Some("error") => {
                            let msg = event["error"]["message"]
                                .as_str()
                                .unwrap_or("stream error")
                                .to_string();
                            let _ = tx.send(TokenChunk::Error(FlowError::Upstream(msg))).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }

            if !stopped {
                let _ = tx
                    .send(TokenChunk::Error(FlowError::Protocol(
                        "stream ended without message_stop".into(),
                    )))
                    .await;
                return;
            }
            let _ = tx
                .send(TokenChunk::Usage {
                    usage,
                    cost_usd: pricing.cost(usage),
                })
                .await;
            let _ = tx.send(TokenChunk::End).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        // Anthropic has no cheap list endpoint; a HEAD-equivalent probe on
        // the messages route answers 400 when reachable and authed.
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({}))
            .send()
            .await
            .map_err(Self::map_transport)?;
        match resp.status().as_u16() {
            400 | 422 => Ok(()),
            401 | 403 => Err(FlowError::Auth("health probe rejected".into())),
            s if (200..300).contains(&s) => Ok(()),
            s => Err(FlowError::Upstream(format!("HTTP {s}"))),
        }
    }
}
