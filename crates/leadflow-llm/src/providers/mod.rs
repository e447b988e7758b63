pub mod anthropic;
pub mod deepseek;
pub mod groq;
pub mod mock;
mod openai_compat;
pub mod ollama;

pub use anthropic::AnthropicProvider;
pub use deepseek::DeepSeekProvider;
pub use groq::GroqProvider;
pub use mock::{MockError, MockProvider, MockResponse, RecordingUsageSink};
pub use ollama::OllamaProvider;
