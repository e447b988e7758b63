use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tokio::sync::mpsc;

use leadflow_core::Result;

use super::openai_compat::OpenAiCompat;
use crate::pricing::PricingRule;
use crate::provider::{Capability, GenerateRequest, Generation, LlmProvider, TokenChunk};

/// Cost-optimized tier used for long-running research tasks.
pub struct DeepSeekProvider {
    inner: OpenAiCompat,
    default_model: String,
}

static PRICING: Lazy<HashMap<&'static str, PricingRule>> = Lazy::new(|| {
    HashMap::from([
        (
            "deepseek-chat",
            PricingRule::PerTokenSplit {
                input_per_mtok: 0.27,
                output_per_mtok: 1.10,
            },
        ),
        (
            "deepseek-reasoner",
            PricingRule::PerTokenSplit {
                input_per_mtok: 0.55,
                output_per_mtok: 2.19,
            },
        ),
    ])
});

const CAPABILITIES: &[Capability] = &[Capability::Streaming, Capability::LongContext];

impl DeepSeekProvider {
    pub fn new(api_key: String, base_url: Option<String>, default_model: String) -> Self {
        Self {
            inner: OpenAiCompat::new(
                base_url.unwrap_or_else(|| "https://api.deepseek.com/v1".into()),
                Some(api_key),
            ),
            default_model,
        }
    }
}

#[async_trait]
impl LlmProvider for DeepSeekProvider {
    fn name(&self) -> &str {
        "deepseek"
    }

    fn endpoint(&self) -> &str {
        "/chat/completions"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn pricing(&self, model: &str) -> PricingRule {
        PRICING.get(model).copied().unwrap_or(PRICING["deepseek-chat"])
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        self.inner.generate(request, self.pricing(&request.model)).await
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        self.inner
            .generate_stream(request, self.pricing(&request.model))
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}
