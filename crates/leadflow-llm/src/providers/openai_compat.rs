//! Shared plumbing for OpenAI-compatible chat APIs (groq, deepseek,
//! ollama). Adapters own identity, capabilities, and pricing; request
//! building, status mapping, and SSE decoding live here.

use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use leadflow_core::{FlowError, Result, TokenUsage};

use crate::pricing::PricingRule;
use crate::provider::{GenerateRequest, Generation, TokenChunk};

pub(crate) struct OpenAiCompat {
    pub client: Client,
    pub base_url: String,
    pub api_key: Option<String>,
}

impl OpenAiCompat {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    pub fn build_body(request: &GenerateRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        if request.response_schema.is_some() {
            // JSON mode; the caller validates against the schema on parse.
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    /// Map an error status to its error class.
    pub fn map_status(status: u16, retry_after: Option<u64>, body: &str) -> FlowError {
        match status {
            401 | 403 => FlowError::Auth(format!("HTTP {status}: {body}")),
            400 | 404 | 422 => FlowError::BadRequest(format!("HTTP {status}: {body}")),
            408 => FlowError::Timeout(format!("HTTP {status}")),
            429 => FlowError::RateLimited {
                retry_after_secs: retry_after,
            },
            _ => FlowError::Upstream(format!("HTTP {status}: {body}")),
        }
    }

    pub fn map_transport(e: reqwest::Error) -> FlowError {
        if e.is_timeout() {
            FlowError::Timeout(e.to_string())
        } else {
            FlowError::Upstream(e.to_string())
        }
    }

    fn retry_after_header(resp: &reqwest::Response) -> Option<u64> {
        resp.headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
        pricing: PricingRule,
    ) -> Result<Generation> {
        let body = Self::build_body(request, false);
        debug!(model = %request.model, "sending chat completion request");

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http.json(&body).send().await.map_err(Self::map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = Self::retry_after_header(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, retry_after, &text));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| FlowError::Protocol("response missing message content".into()))?
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(Generation {
            content,
            usage,
            cost_usd: pricing.cost(usage),
            model: request.model.clone(),
            cache_hit: false,
        })
    }

    pub async fn generate_stream(
        &self,
        request: &GenerateRequest,
        pricing: PricingRule,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        let body = Self::build_body(request, true);
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let mut http = client
                .post(format!("{base_url}/chat/completions"))
                .header("content-type", "application/json");
            if let Some(key) = &api_key {
                http = http.bearer_auth(key);
            }
            let resp = match http.json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx.send(TokenChunk::Error(Self::map_transport(e))).await;
                    return;
                }
            };
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let retry_after = Self::retry_after_header(&resp);
                let text = resp.text().await.unwrap_or_default();
                let _ = tx
                    .send(TokenChunk::Error(Self::map_status(status, retry_after, &text)))
                    .await;
                return;
            }

            use futures::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut done = false;

            while let Some(chunk_result) = stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(TokenChunk::Error(Self::map_transport(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        done = true;
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    if let Some(text) = event["choices"][0]["delta"]["content"].as_str()
                        && !text.is_empty()
                        && tx.send(TokenChunk::Token(text.to_string())).await.is_err()
                    {
                        return; // receiver dropped
                    }
                    if event["usage"].is_object() {
                        usage.prompt_tokens =
                            event["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.completion_tokens =
                            event["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
                    }
                }
            }

            if !done {
                let _ = tx
                    .send(TokenChunk::Error(FlowError::Protocol(
                        "stream ended without terminator".into(),
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

    pub async fn health_check(&self) -> Result<()> {
        let mut http = self.client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http.send().await.map_err(Self::map_transport)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(FlowError::Upstream(format!("HTTP {}", resp.status())))
        }
    }
}
