use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the entire leadflow core.
#[derive(Error, Debug)]
pub enum FlowError {
    // ── Provider call errors ───────────────────────────────────
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited{}", retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    #[error("provider not registered: {0}")]
    ProviderNotFound(String),

    #[error("no provider available for task")]
    NoProviderAvailable,

    // ── Agent execution errors ─────────────────────────────────
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("recursion limit exhausted after {steps} steps")]
    RecursionExhausted { steps: u32 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("graph compile error: {0}")]
    GraphCompile(String),

    #[error("structured output invalid after reprompts: {0}")]
    StructuredOutput(String),

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Streaming errors ───────────────────────────────────────
    #[error("subscriber too slow on stream {stream_id}")]
    SlowSubscriber { stream_id: Uuid },

    #[error("stream gone: {0}")]
    StreamGone(Uuid),

    // ── Scheduler errors ───────────────────────────────────────
    #[error("worker pool saturated, dispatch rejected")]
    Backpressure,

    // ── CRM errors ─────────────────────────────────────────────
    #[error("crm platform error: {platform}: {reason}")]
    Platform { platform: String, reason: String },

    #[error("credential error: {0}")]
    Credential(String),

    // ── Infrastructure wrappers ────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Short stable code recorded on audit rows and terminal chunks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::BadRequest(_) | Self::StructuredOutput(_) => "bad_request",
            Self::RateLimited { .. } => "rate_limit",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProviderNotFound(_) | Self::NoProviderAvailable => "no_provider",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::RecursionExhausted { .. } => "recursion_exhausted",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::GraphCompile(_) => "graph_compile",
            Self::ToolNotFound(_) | Self::ToolExecution { .. } => "tool_error",
            Self::SlowSubscriber { .. } => "slow_subscriber",
            Self::StreamGone(_) => "gone",
            Self::Backpressure => "backpressure",
            Self::Platform { .. } => "platform_error",
            Self::Credential(_) => "credential_error",
            Self::Store(_) => "store_error",
            Self::Bus(_) => "bus_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
