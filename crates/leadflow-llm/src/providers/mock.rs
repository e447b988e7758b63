//! Mock LLM provider for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use leadflow_core::{FlowError, Result, TokenUsage};

use crate::pricing::PricingRule;
use crate::provider::{Capability, GenerateRequest, Generation, LlmProvider, TokenChunk};

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// If set, the call fails with this error class instead.
    pub error: Option<MockError>,
    /// For streams: fail after this many tokens have been emitted.
    /// `Some(0)` fails before the first token.
    pub fail_after_tokens: Option<usize>,
    /// For streams: pause between tokens, so tests can interleave
    /// cancellation mid-stream.
    pub token_delay_ms: Option<u64>,
}

/// Error classes the mock can produce, mirroring the adapter taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    Auth,
    BadRequest,
    RateLimited,
    Upstream,
    Timeout,
    Protocol,
}

impl MockError {
    fn to_flow_error(self) -> FlowError {
        match self {
            MockError::Auth => FlowError::Auth("mock auth failure".into()),
            MockError::BadRequest => FlowError::BadRequest("mock bad request".into()),
            MockError::RateLimited => FlowError::RateLimited {
                retry_after_secs: None,
            },
            MockError::Upstream => FlowError::Upstream("mock HTTP 503".into()),
            MockError::Timeout => FlowError::Timeout("mock timeout".into()),
            MockError::Protocol => FlowError::Protocol("mock garbage response".into()),
        }
    }
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
            },
            error: None,
            fail_after_tokens: None,
            token_delay_ms: None,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn error(error: MockError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// A stream that emits `text` then fails mid-stream after `tokens`
    /// whitespace-separated tokens.
    pub fn fails_mid_stream(text: &str, tokens: usize, error: MockError) -> Self {
        Self {
            text: text.to_string(),
            error: Some(error),
            fail_after_tokens: Some(tokens),
            ..Default::default()
        }
    }

    /// A stream that pauses between tokens.
    pub fn slow_stream(text: &str, token_delay_ms: u64) -> Self {
        Self {
            text: text.to_string(),
            token_delay_ms: Some(token_delay_ms),
            ..Default::default()
        }
    }
}

/// A [`leadflow_core::UsageSink`] that keeps rows in memory for
/// assertions.
#[derive(Default)]
pub struct RecordingUsageSink {
    pub logs: Mutex<Vec<leadflow_core::ApiCallLog>>,
}

impl RecordingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<leadflow_core::ApiCallLog> {
        self.logs.lock().unwrap().clone()
    }
}

impl leadflow_core::UsageSink for RecordingUsageSink {
    fn record(&self, log: leadflow_core::ApiCallLog) {
        self.logs.lock().unwrap().push(log);
    }
}

/// A mock [`LlmProvider`] with queued responses and recorded requests.
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// All requests received, for assertions.
    pub requests: Arc<Mutex<Vec<GenerateRequest>>>,
    pricing: PricingRule,
    capabilities: Vec<Capability>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            pricing: PricingRule::PerTokenSplit {
                input_per_mtok: 1.0,
                output_per_mtok: 2.0,
            },
            capabilities: vec![Capability::Streaming],
        }
    }

    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(MockResponse::text(text));
        self
    }

    pub fn with_error(self, error: MockError) -> Self {
        self.responses.lock().unwrap().push(MockResponse::error(error));
        self
    }

    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().unwrap().push(resp);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingRule) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn queue_response(&self, resp: MockResponse) {
        self.responses.lock().unwrap().push(resp);
    }

    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<GenerateRequest>>> {
        Arc::clone(&self.requests)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockResponse::text("(mock: no more queued responses)")
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        "/mock"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn pricing(&self, _model: &str) -> PricingRule {
        self.pricing
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();

        if let Some(error) = mock.error {
            return Err(error.to_flow_error());
        }

        Ok(Generation {
            content: mock.text,
            usage: mock.usage,
            cost_usd: self.pricing.cost(mock.usage),
            model: request.model.clone(),
            cache_hit: false,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();
        let (tx, rx) = mpsc::channel(64);
        let pricing = self.pricing;

        tokio::spawn(async move {
            let fail_after = mock.fail_after_tokens;
            if let (Some(error), Some(0) | None) = (mock.error, fail_after) {
                // Fails before the first token.
                let _ = tx.send(TokenChunk::Error(error.to_flow_error())).await;
                return;
            }

            let mut emitted = 0usize;
            for word in mock.text.split_whitespace() {
                if let Some(limit) = fail_after
                    && emitted >= limit
                {
                    break;
                }
                if let Some(delay) = mock.token_delay_ms {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                let _ = tx.send(TokenChunk::Token(format!("{word} "))).await;
                emitted += 1;
            }

            if let Some(error) = mock.error {
                let _ = tx.send(TokenChunk::Error(error.to_flow_error())).await;
                return;
            }

            let _ = tx
                .send(TokenChunk::Usage {
                    usage: mock.usage,
                    cost_usd: pricing.cost(mock.usage),
                })
                .await;
            let _ = tx.send(TokenChunk::End).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_text_response() {
        let provider = MockProvider::new("mock").with_response("Hello!");
        let req = GenerateRequest::new("mock-model", "hi");
        let resp = provider.generate(&req).await.unwrap();
        assert_eq!(resp.content, "Hello!");
        assert!(resp.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn mock_error_response() {
        let provider = MockProvider::new("mock").with_error(MockError::RateLimited);
        let req = GenerateRequest::new("mock-model", "hi");
        let err = provider.generate(&req).await.unwrap_err();
        assert_eq!(err.code(), "rate_limit");
    }

    #[tokio::test]
    async fn mock_streaming_ends_with_usage_then_end() {
        let provider = MockProvider::new("mock").with_response("one two three");
        let req = GenerateRequest::new("mock-model", "hi");
        let mut rx = provider.generate_stream(&req).await.unwrap();

        let mut tokens = 0;
        let mut saw_usage = false;
        let mut saw_end = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                TokenChunk::Token(_) => tokens += 1,
                TokenChunk::Usage { .. } => saw_usage = true,
                TokenChunk::End => saw_end = true,
                TokenChunk::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(tokens, 3);
        assert!(saw_usage);
        assert!(saw_end);
    }

    #[tokio::test]
    async fn mock_mid_stream_failure() {
        let provider = MockProvider::new("mock").with_mock_response(
            MockResponse::fails_mid_stream("a b c d", 2, MockError::Upstream),
        );
        let req = GenerateRequest::new("mock-model", "hi");
        let mut rx = provider.generate_stream(&req).await.unwrap();

        let mut tokens = 0;
        let mut errored = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                TokenChunk::Token(_) => tokens += 1,
                TokenChunk::Error(_) => errored = true,
                _ => {}
            }
        }
        assert_eq!(tokens, 2);
        assert!(errored);
    }

    #[tokio::test]
    async fn mock_records_requests_in_order() {
        let provider = MockProvider::new("mock")
            .with_response("first")
            .with_response("second");
        let req = GenerateRequest::new("mock-model", "question");
        let r1 = provider.generate(&req).await.unwrap();
        let r2 = provider.generate(&req).await.unwrap();
        assert_eq!(r1.content, "first");
        assert_eq!(r2.content, "second");
        assert_eq!(provider.request_count(), 2);
    }
}
