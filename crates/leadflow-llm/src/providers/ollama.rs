use async_trait::async_trait;
use tokio::sync::mpsc;

use leadflow_core::Result;

use super::openai_compat::OpenAiCompat;
use crate::pricing::PricingRule;
use crate::provider::{Capability, GenerateRequest, Generation, LlmProvider, TokenChunk};

/// Local provider via an OpenAI-compatible endpoint. Free, no key.
/// Default for simple parsing when reachable.
pub struct OllamaProvider {
    inner: OpenAiCompat,
    default_model: String,
}

const CAPABILITIES: &[Capability] = &[Capability::Streaming];

impl OllamaProvider {
    pub fn new(base_url: Option<String>, default_model: String) -> Self {
        Self {
            inner: OpenAiCompat::new(
                format!(
                    "{}/v1",
                    base_url
                        .unwrap_or_else(|| "http://localhost:11434".into())
                        .trim_end_matches('/')
                ),
                None,
            ),
            default_model,
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn endpoint(&self) -> &str {
        "/v1/chat/completions"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn pricing(&self, _model: &str) -> PricingRule {
        PricingRule::Free
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        self.inner.generate(request, PricingRule::Free).await
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        self.inner.generate_stream(request, PricingRule::Free).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}
