//! # leadflow-llm
//!
//! Abstraction layer over LLM providers: uniform unary and streaming
//! adapters, per-provider circuit breakers, bounded exponential-backoff
//! retries, and the task-class router that builds fallback chains under
//! latency and cost constraints.

pub mod breaker;
pub mod client;
pub mod pricing;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod router;

pub use breaker::{Admission, BreakerRegistry, CircuitBreaker};
pub use client::ResilientClient;
pub use pricing::PricingRule;
pub use provider::{
    Capability, GenerateRequest, Generation, ImageInput, LlmProvider, TokenChunk,
};
pub use providers::{
    AnthropicProvider, DeepSeekProvider, GroqProvider, MockError, MockProvider, MockResponse,
    OllamaProvider, RecordingUsageSink,
};
pub use retry::{RetryPolicy, is_retryable, retry_after_hint};
pub use router::{HealthTracker, ProviderRouter, RouteQuery};
