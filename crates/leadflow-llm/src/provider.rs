use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use leadflow_core::{FlowError, Result, TokenUsage};

use crate::pricing::PricingRule;

/// Optional capabilities a provider may advertise. The router consults
/// capabilities, never adapter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vision,
    Streaming,
    LongContext,
    PromptCaching,
}

/// Inline image attached to a request (only honored by providers that
/// advertise [`Capability::Vision`]).
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// Raw bytes, base64-encoded by the adapter as needed.
    pub data: Vec<u8>,
    pub media_type: String,
}

/// A request to one LLM provider.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Provider-specific model tag, e.g. "llama-3.3-70b-versatile".
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    /// Temperature in [0, 2].
    pub temperature: f32,
    /// Ask the provider to reuse cached prompt prefixes where supported.
    pub enable_caching: bool,
    pub image: Option<ImageInput>,
    /// JSON Schema the response must satisfy. Providers with request-side
    /// schema enforcement pass it through; others get a JSON-mode hint.
    pub response_schema: Option<Value>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            max_tokens: 1024,
            temperature: 0.7,
            enable_caching: false,
            image: None,
            response_schema: None,
        }
    }
}

/// A complete (non-streaming) generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
    /// Cost in USD, computed from the provider's pricing rule at call time.
    pub cost_usd: f64,
    pub model: String,
    /// Whether the provider reported a prompt-cache hit.
    pub cache_hit: bool,
}

/// One unit of a streamed generation. Adapters must preserve token order.
#[derive(Debug)]
pub enum TokenChunk {
    Token(String),
    /// Final accounting, sent before `End` on success.
    Usage { usage: TokenUsage, cost_usd: f64 },
    End,
    /// The stream failed. Nothing follows.
    Error(FlowError),
}

/// Trait implemented by each LLM provider adapter. Adapters are stateless
/// apart from their connection pool and are safe for concurrent use.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider tag, e.g. "groq", "anthropic".
    fn name(&self) -> &str;

    /// Endpoint tag recorded on audit rows.
    fn endpoint(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Pricing rule for a model. Immutable for the process lifetime.
    fn pricing(&self, model: &str) -> PricingRule;

    /// Default model used when the caller does not pick one.
    fn default_model(&self) -> &str;

    /// One-shot generation.
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation>;

    /// Streaming generation. The receiver yields tokens in order and
    /// terminates with `Usage` + `End`, or with a single `Error`.
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<TokenChunk>>;

    /// Cheap reachability check.
    async fn health_check(&self) -> Result<()>;
}
