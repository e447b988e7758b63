use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use leadflow_config::RouterConfig;
use leadflow_core::{Result, TaskClass};

use crate::breaker::BreakerRegistry;
use crate::provider::{Capability, LlmProvider};

/// One routed request's constraints.
#[derive(Debug, Clone, Default)]
pub struct RouteQuery {
    pub task: TaskClass,
    pub max_latency_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub required_capabilities: Vec<Capability>,
    pub forced_provider: Option<String>,
    /// `max_tokens` of the eventual request, for the cost estimator.
    pub max_tokens: u32,
}

impl RouteQuery {
    pub fn for_task(task: TaskClass) -> Self {
        Self {
            task,
            max_tokens: 1024,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
    latency_ms: u64,
}

/// Rolling per-provider outcome window feeding the router's success-rate
/// and latency filters. Fed by the resilient client on every terminal
/// outcome.
#[derive(Default)]
pub struct HealthTracker {
    samples: Mutex<HashMap<String, VecDeque<Sample>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, success: bool, latency_ms: u64) {
        let mut samples = self.samples.lock();
        let window = samples.entry(provider.to_string()).or_default();
        window.push_back(Sample {
            at: Instant::now(),
            success,
            latency_ms,
        });
        // Bounded memory regardless of traffic.
        while window.len() > 4096 {
            window.pop_front();
        }
    }

    /// Success rate over the window, or None with no data.
    pub fn success_rate(&self, provider: &str, window: Duration) -> Option<f64> {
        let samples = self.samples.lock();
        let window_samples = samples.get(provider)?;
        let cutoff = Instant::now().checked_sub(window)?;
        let recent: Vec<_> = window_samples.iter().filter(|s| s.at >= cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let ok = recent.iter().filter(|s| s.success).count();
        Some(ok as f64 / recent.len() as f64)
    }

    /// Running p95 latency over the window, successful calls only.
    pub fn p95_latency_ms(&self, provider: &str, window: Duration) -> Option<u64> {
        let samples = self.samples.lock();
        let window_samples = samples.get(provider)?;
        let cutoff = Instant::now().checked_sub(window)?;
        let mut latencies: Vec<u64> = window_samples
            .iter()
            .filter(|s| s.at >= cutoff && s.success)
            .map(|s| s.latency_ms)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let idx = ((latencies.len() as f64) * 0.95).ceil() as usize - 1;
        Some(latencies[idx.min(latencies.len() - 1)])
    }
}

/// Selects an ordered fallback chain of providers for a request.
///
/// Decisions are pure given the current breaker and health state: two
/// identical queries produce the same chain.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthTracker>,
    success_floor: f64,
    health_window: Duration,
}

/// Task-default chains. First entry is the preferred provider.
fn task_defaults(task: TaskClass) -> &'static [&'static str] {
    match task {
        TaskClass::Qualification => &["groq"],
        TaskClass::Enrichment => &["groq", "anthropic"],
        TaskClass::Growth => &["deepseek"],
        TaskClass::Marketing => &["anthropic"],
        TaskClass::Bdr => &["groq", "anthropic"],
        TaskClass::Conversation => &["groq", "anthropic"],
        TaskClass::Parsing => &["ollama", "groq"],
        TaskClass::Vision => &["anthropic"],
        TaskClass::Embedding => &["ollama"],
        TaskClass::Other => &["groq", "anthropic"],
    }
}

impl ProviderRouter {
    pub fn new(
        config: &RouterConfig,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            breakers,
            health,
            success_floor: config.success_floor,
            health_window: Duration::from_secs(config.health_window_mins * 60),
        }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        debug!(provider = provider.name(), "registered provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    fn estimated_cost(&self, name: &str, max_tokens: u32) -> f64 {
        self.providers
            .get(name)
            .map(|p| p.pricing(p.default_model()).estimate(max_tokens))
            .unwrap_or(f64::MAX)
    }

    fn has_capabilities(&self, name: &str, required: &[Capability]) -> bool {
        let Some(provider) = self.providers.get(name) else {
            return false;
        };
        required.iter().all(|c| provider.capabilities().contains(c))
    }

    /// Build the fallback chain for a query. Never empty on success.
    pub fn chain(&self, query: &RouteQuery) -> Result<Vec<String>> {
        // 1. Forced provider wins when it is registered and not open.
        if let Some(forced) = &query.forced_provider {
            if self.providers.contains_key(forced) && !self.breakers.is_open(forced) {
                return Ok(vec![forced.clone()]);
            }
            warn!(provider = %forced, "forced provider unavailable, falling through to defaults");
        }

        // 2. Task-default table, restricted to registered providers with
        //    the required capabilities.
        let candidates: Vec<String> = task_defaults(query.task)
            .iter()
            .filter(|name| self.providers.contains_key(**name))
            .filter(|name| self.has_capabilities(name, &query.required_capabilities))
            .map(|name| name.to_string())
            .collect();

        // 3-5. Availability, latency, and cost filters.
        let mut filtered: Vec<String> = candidates
            .iter()
            .filter(|name| !self.breakers.is_open(name))
            .filter(|name| {
                self.health
                    .success_rate(name, self.health_window)
                    .is_none_or(|rate| rate >= self.success_floor)
            })
            .filter(|name| {
                query.max_latency_ms.is_none_or(|budget| {
                    self.health
                        .p95_latency_ms(name, self.health_window)
                        .is_none_or(|p95| p95 <= budget)
                })
            })
            .filter(|name| {
                query
                    .max_cost_usd
                    .is_none_or(|budget| self.estimated_cost(name, query.max_tokens) <= budget)
            })
            .cloned()
            .collect();

        // 6. Degrade: hand the retry layer the cheapest candidate rather
        //    than failing the request outright.
        if filtered.is_empty() {
            let cheapest = candidates.into_iter().min_by(|a, b| {
                self.estimated_cost(a, query.max_tokens)
                    .total_cmp(&self.estimated_cost(b, query.max_tokens))
            });
            return match cheapest {
                Some(name) => {
                    warn!(provider = %name, task = query.task.as_str(), "degraded routing: all providers filtered out");
                    Ok(vec![name])
                }
                None => Err(leadflow_core::FlowError::NoProviderAvailable),
            };
        }

        // Ordering: cost governs over latency; otherwise task order.
        if query.max_cost_usd.is_some() {
            filtered.sort_by(|a, b| {
                self.estimated_cost(a, query.max_tokens)
                    .total_cmp(&self.estimated_cost(b, query.max_tokens))
            });
        } else if query.max_latency_ms.is_some() {
            filtered.sort_by_key(|name| {
                self.health
                    .p95_latency_ms(name, self.health_window)
                    .unwrap_or(u64::MAX)
            });
        }

        Ok(filtered)
    }
}
