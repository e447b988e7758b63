//! Wiring hub and library surface. The web layer (out of scope here)
//! maps these operations onto URLs; everything below them is injected,
//! so tests assemble the same graph from mocks.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use leadflow_bus::Bus;
use leadflow_bus::memory::MemoryBus;
use leadflow_config::FlowConfig;
use leadflow_core::{
    Chunk, FlowError, Interval, LatencyPercentiles, LogTraceSink, RealtimeMetrics, Result,
    SyncDirection, SyncResult, UsageBucket, UsageSink,
};
use leadflow_crm::{
    ApolloPlatform, CredentialVault, DeadLetterQueue, HubSpotPlatform, PlatformHealth,
    RateLimiter, SalesNavPlatform, SyncEngine, SyncFilters, SyncHandle, SyncMetrics,
};
use leadflow_llm::{
    AnthropicProvider, BreakerRegistry, DeepSeekProvider, GroqProvider, HealthTracker,
    OllamaProvider, ProviderRouter, ResilientClient, RetryPolicy,
};
use leadflow_store::{Repository, SqliteStore};
use leadflow_stream::StreamFabric;
use leadflow_usage::UsageTracker;

use crate::agents::{builtin_agents, builtin_tools};
use crate::executor::{AgentRuntime, ExecutionState, InvokeOptions, InvokeResult};
use crate::scheduler::{JobHandle, JobKind, Scheduler};

/// The assembled orchestration core.
pub struct Orchestrator {
    pub runtime: Arc<AgentRuntime>,
    pub sync_engine: Arc<SyncEngine>,
    pub usage: UsageTracker,
    pub scheduler: Arc<Scheduler>,
    pub vault: Option<Arc<CredentialVault>>,
    bus: Arc<dyn Bus>,
}

impl Orchestrator {
    /// Assemble the core from validated configuration. Credentials come
    /// from the environment variables the config names; `FlowConfig`
    /// validation has already made their absence fatal.
    pub fn from_config(config: &FlowConfig) -> Result<Self> {
        let repo: Arc<dyn Repository> = Arc::new(SqliteStore::open(&config.storage.db_path)?);
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());

        // Provider stack
        let breakers = Arc::new(BreakerRegistry::new(&config.breaker));
        let health = Arc::new(HealthTracker::new());
        let mut router = ProviderRouter::new(
            &config.router,
            Arc::clone(&breakers),
            Arc::clone(&health),
        );
        let providers = &config.providers;
        if providers.groq.enabled {
            router.add_provider(Arc::new(GroqProvider::new(
                std::env::var(&providers.groq.api_key_env).unwrap_or_default(),
                providers.groq.base_url.clone(),
                providers.groq.default_model.clone(),
            )));
        }
        if providers.anthropic.enabled {
            router.add_provider(Arc::new(AnthropicProvider::new(
                std::env::var(&providers.anthropic.api_key_env).unwrap_or_default(),
                providers.anthropic.base_url.clone(),
                providers.anthropic.default_model.clone(),
            )));
        }
        if providers.deepseek.enabled {
            router.add_provider(Arc::new(DeepSeekProvider::new(
                std::env::var(&providers.deepseek.api_key_env).unwrap_or_default(),
                providers.deepseek.base_url.clone(),
                providers.deepseek.default_model.clone(),
            )));
        }
        if providers.ollama.enabled {
            router.add_provider(Arc::new(OllamaProvider::new(
                providers.ollama.base_url.clone(),
                providers.ollama.default_model.clone(),
            )));
        }

        let usage = UsageTracker::new(Arc::clone(&repo), Arc::clone(&bus), &config.usage);
        let retry = RetryPolicy::from_config(&config.retry);
        let client = Arc::new(ResilientClient::new(
            router,
            Arc::clone(&breakers),
            Arc::clone(&health),
            retry.clone(),
            Arc::new(usage.clone()) as Arc<dyn UsageSink>,
        ));

        // Streaming fabric
        let fabric = Arc::new(StreamFabric::new(Arc::clone(&bus), &config.stream));

        // CRM stack, with its own breakers per platform
        let crm_breakers = Arc::new(BreakerRegistry::new(&config.breaker));
        let limiter = RateLimiter::new(Arc::clone(&bus));
        let dlq = DeadLetterQueue::new(Arc::clone(&bus), config.crm.dlq_cap);
        let mut sync_engine = SyncEngine::new(
            Arc::clone(&repo),
            limiter,
            dlq,
            crm_breakers,
            retry.clone(),
        );
        for (tag, platform) in &config.crm.platforms {
            if !platform.enabled {
                continue;
            }
            let key = std::env::var(&platform.api_key_env).unwrap_or_default();
            match tag.as_str() {
                "hubspot" => sync_engine
                    .add_platform(Arc::new(HubSpotPlatform::new(key, platform.daily_call_budget))),
                "apollo" => sync_engine
                    .add_platform(Arc::new(ApolloPlatform::new(key, platform.daily_call_budget))),
                "salesnav" => sync_engine.add_platform(Arc::new(SalesNavPlatform::new(
                    key,
                    platform.daily_call_budget,
                ))),
                other => {
                    return Err(FlowError::Config(format!("unknown crm platform {other}")));
                }
            }
        }
        let sync_engine = Arc::new(sync_engine);

        let vault = match std::env::var(&config.crypto.key_env) {
            Ok(key) => Some(Arc::new(CredentialVault::new(
                &key,
                Arc::clone(&repo),
                Arc::clone(&bus),
            )?)),
            Err(_) => None,
        };

        // Agent runtime with the built-in agent set
        let tools = Arc::new(builtin_tools());
        let mut runtime = AgentRuntime::new(
            Arc::clone(&client),
            Arc::clone(&tools),
            Arc::clone(&repo),
            Arc::clone(&fabric),
            Arc::new(LogTraceSink),
            config.agents.clone(),
        );
        for (name, kind) in builtin_agents(&tools)? {
            runtime.register_agent(&name, kind);
        }
        let runtime = Arc::new(runtime);

        let scheduler = Arc::new(
            Scheduler::new(
                &config.scheduler,
                Arc::clone(&sync_engine),
                Arc::clone(&bus),
                Arc::clone(runtime.checkpoints()),
            )
            .with_standard_jobs(),
        );

        Ok(Self {
            runtime,
            sync_engine,
            usage,
            scheduler,
            vault,
            bus,
        })
    }

    /// Spawn the scheduler loop. Call once at startup.
    pub fn start_scheduler(&self) {
        tokio::spawn(Arc::clone(&self.scheduler).run());
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    // ── Agent operations ───────────────────────────────────────

    pub async fn invoke_agent(
        &self,
        agent: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<InvokeResult> {
        self.runtime.invoke_agent(agent, input, options).await
    }

    pub async fn stream_agent(
        &self,
        agent: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<(Uuid, mpsc::Receiver<Chunk>)> {
        self.runtime.stream_agent(agent, input, options).await
    }

    pub async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState> {
        self.runtime.get_execution_state(execution_id).await
    }

    pub async fn resume(&self, execution_id: Uuid, input: Value) -> Result<InvokeResult> {
        self.runtime.resume(execution_id, input).await
    }

    pub fn cancel(&self, stream_id: Uuid) -> Result<()> {
        self.runtime.cancel(stream_id)
    }

    // ── Sync operations ────────────────────────────────────────

    pub fn trigger_sync(
        &self,
        platform: &str,
        direction: SyncDirection,
        filters: Option<SyncFilters>,
    ) -> Result<SyncHandle> {
        self.sync_engine
            .sync(platform, direction, filters.unwrap_or_default())
    }

    pub fn sync_status(&self, platform: Option<&str>) -> Vec<(String, SyncDirection, Uuid)> {
        self.sync_engine.sync_status(platform)
    }

    pub async fn sync_history(
        &self,
        platform: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncResult>> {
        self.sync_engine.sync_history(platform, limit).await
    }

    pub async fn sync_metrics(
        &self,
        platform: Option<&str>,
        window: chrono::Duration,
    ) -> Result<SyncMetrics> {
        self.sync_engine.sync_metrics(platform, window).await
    }

    pub async fn sync_health(&self) -> Result<Vec<PlatformHealth>> {
        self.sync_engine.sync_health().await
    }

    pub fn dispatch_job(&self, label: &str, kind: JobKind) -> Result<JobHandle> {
        self.scheduler.dispatch(label, kind)
    }

    // ── Usage operations ───────────────────────────────────────

    pub async fn usage_metrics_realtime(&self) -> Result<RealtimeMetrics> {
        self.usage.real_time_metrics().await
    }

    pub async fn usage_aggregates(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        provider: Option<&str>,
    ) -> Result<Vec<UsageBucket>> {
        self.usage.aggregates(start, end, interval, provider).await
    }

    pub async fn usage_cost_by_provider(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        self.usage.cost_by_provider(start, end).await
    }

    pub async fn usage_latency_percentiles(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<LatencyPercentiles> {
        self.usage.latency_percentiles(start, end, provider).await
    }
}
