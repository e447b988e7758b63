use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration, mapping to `leadflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub providers: ProvidersConfig,
    pub router: RouterConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub usage: UsageConfig,
    pub agents: AgentsConfig,
    pub stream: StreamConfig,
    pub crm: CrmConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub logging: LoggingConfig,
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub groq: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub deepseek: ProviderConfig,
    pub ollama: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            groq: ProviderConfig {
                enabled: true,
                api_key_env: "GROQ_API_KEY".into(),
                base_url: None,
                default_model: "llama-3.3-70b-versatile".into(),
            },
            anthropic: ProviderConfig {
                enabled: true,
                api_key_env: "ANTHROPIC_API_KEY".into(),
                base_url: None,
                default_model: "claude-sonnet-4-20250514".into(),
            },
            deepseek: ProviderConfig {
                enabled: true,
                api_key_env: "DEEPSEEK_API_KEY".into(),
                base_url: None,
                default_model: "deepseek-chat".into(),
            },
            ollama: ProviderConfig {
                enabled: false,
                api_key_env: String::new(),
                base_url: Some("http://localhost:11434".into()),
                default_model: "llama3.1:8b".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Name of the environment variable holding the API key.
    /// Empty means the provider needs no key (local models).
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub default_model: String,
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Providers whose rolling success rate drops below this fraction are
    /// filtered out of fallback chains.
    pub success_floor: f64,
    /// Rolling window for success-rate and latency estimates, in minutes.
    pub health_window_mins: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            success_floor: 0.5,
            health_window_mins: 60,
        }
    }
}

// ── Breaker / retry ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed.
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

// ── Usage tracker ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// TTL of the cached realtime summary, in seconds.
    pub cache_ttl_secs: u64,
    /// Max rows buffered before the background writer flushes.
    pub batch_size: usize,
    /// Max milliseconds a buffered row waits before a flush.
    pub flush_interval_ms: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            batch_size: 64,
            flush_interval_ms: 250,
        }
    }
}

// ── Agents ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Hard cap on graph steps per invocation.
    pub max_steps: u32,
    /// Checkpoints older than this are treated as absent.
    pub checkpoint_ttl_hours: u64,
    /// Default wall-clock deadline per invocation, seconds. 0 = none.
    pub default_deadline_secs: u64,
    /// Structured-output validation reprompts before giving up.
    pub reprompt_attempts: u32,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            checkpoint_ttl_hours: 24,
            default_deadline_secs: 300,
            reprompt_attempts: 2,
        }
    }
}

// ── Streaming fabric ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-subscriber queue bound; beyond it the subscriber is dropped.
    pub subscriber_buffer: usize,
    /// How long a terminal chunk stays retrievable after close, seconds.
    pub grace_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            grace_secs: 60,
        }
    }
}

// ── CRM ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    /// Max dead-letter items retained per platform stream.
    pub dlq_cap: usize,
    pub platforms: HashMap<String, PlatformConfig>,
}

impl Default for CrmConfig {
    fn default() -> Self {
        let mut platforms = HashMap::new();
        platforms.insert(
            "hubspot".to_string(),
            PlatformConfig {
                enabled: true,
                api_key_env: "HUBSPOT_API_KEY".into(),
                daily_call_budget: 250_000,
                reset_boundary: ResetBoundary::Day,
            },
        );
        platforms.insert(
            "apollo".to_string(),
            PlatformConfig {
                enabled: true,
                api_key_env: "APOLLO_API_KEY".into(),
                daily_call_budget: 600,
                reset_boundary: ResetBoundary::Day,
            },
        );
        platforms.insert(
            "salesnav".to_string(),
            PlatformConfig {
                enabled: false,
                api_key_env: "SALESNAV_API_KEY".into(),
                daily_call_budget: 100,
                reset_boundary: ResetBoundary::Day,
            },
        );
        Self {
            dlq_cap: 10_000,
            platforms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub enabled: bool,
    pub api_key_env: String,
    pub daily_call_budget: u64,
    pub reset_boundary: ResetBoundary,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key_env: String::new(),
            daily_call_budget: 1_000,
            reset_boundary: ResetBoundary::Day,
        }
    }
}

/// When a platform's call counter resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetBoundary {
    #[default]
    Day,
    Hour,
}

// ── Scheduler ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent worker slots for dispatched jobs.
    pub workers: usize,
    /// Jobs queued beyond the worker pool before dispatch is rejected.
    pub queue_cap: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_cap: 64,
        }
    }
}

// ── Storage / crypto / logging ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. ":memory:" for tests.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("leadflow.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Environment variable holding the base64 32-byte AES key used for
    /// CRM credential and enrichment encryption.
    pub key_env: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_env: "LEADFLOW_ENCRYPTION_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl FlowConfig {
    /// Validate the configuration. Returns warnings; errors are fatal.
    ///
    /// Missing credentials for an enabled provider or platform, or a
    /// missing encryption key, fail startup.
    pub fn validate(&self) -> std::result::Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        for (tag, provider) in [
            ("groq", &self.providers.groq),
            ("anthropic", &self.providers.anthropic),
            ("deepseek", &self.providers.deepseek),
            ("ollama", &self.providers.ollama),
        ] {
            if !provider.enabled {
                continue;
            }
            if provider.api_key_env.is_empty() {
                continue; // keyless (local) provider
            }
            if std::env::var(&provider.api_key_env).is_err() {
                return Err(format!(
                    "provider {tag} is enabled but {} is not set",
                    provider.api_key_env
                ));
            }
        }

        for (tag, platform) in &self.crm.platforms {
            if platform.enabled && std::env::var(&platform.api_key_env).is_err() {
                return Err(format!(
                    "crm platform {tag} is enabled but {} is not set",
                    platform.api_key_env
                ));
            }
        }

        if self.crm.platforms.values().any(|p| p.enabled)
            && std::env::var(&self.crypto.key_env).is_err()
        {
            return Err(format!(
                "crm platforms are enabled but {} is not set",
                self.crypto.key_env
            ));
        }

        if !(0.0..=1.0).contains(&self.router.success_floor) {
            return Err(format!(
                "router.success_floor must be in [0,1], got {}",
                self.router.success_floor
            ));
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; transient errors will not be retried".into());
        }
        if self.scheduler.workers == 0 {
            return Err("scheduler.workers must be at least 1".into());
        }

        Ok(warnings)
    }
}
