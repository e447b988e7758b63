use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use leadflow_core::{ApiCallLog, FlowError, Result, TaskClass, TokenUsage, UsageSink};

use crate::breaker::{Admission, BreakerRegistry};
use crate::provider::{GenerateRequest, Generation, LlmProvider, TokenChunk};
use crate::retry::{RetryPolicy, is_retryable, retry_after_hint};
use crate::router::{HealthTracker, ProviderRouter, RouteQuery};

/// Errors that say something about provider health advance the breaker's
/// failure count; auth and schema problems do not.
fn breaker_counts(err: &FlowError) -> bool {
    matches!(
        err,
        FlowError::Upstream(_) | FlowError::Timeout(_) | FlowError::Protocol(_)
    )
}

/// Walks the router's fallback chain, applying breaker admission and
/// bounded retries per provider, and records exactly one audit row per
/// terminal outcome, including circuit-open fast-fails.
pub struct ResilientClient {
    router: ProviderRouter,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthTracker>,
    retry: RetryPolicy,
    usage: Arc<dyn UsageSink>,
}

impl ResilientClient {
    pub fn new(
        router: ProviderRouter,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthTracker>,
        retry: RetryPolicy,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            router,
            breakers,
            health,
            retry,
            usage,
        }
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    fn log_circuit_open(&self, provider: &dyn LlmProvider, model: &str, task: TaskClass) {
        self.usage.record(ApiCallLog::failure(
            provider.name(),
            model,
            provider.endpoint(),
            task,
            TokenUsage::default(),
            0,
            "circuit_open",
        ));
    }

    /// One-shot generation with fallback across the chain.
    pub async fn generate(
        &self,
        query: &RouteQuery,
        request: &GenerateRequest,
    ) -> Result<Generation> {
        let chain = self.router.chain(query)?;
        let mut last_err = FlowError::NoProviderAvailable;

        for name in &chain {
            let provider = self
                .router
                .get(name)
                .ok_or_else(|| FlowError::ProviderNotFound(name.clone()))?;
            let mut req = request.clone();
            if req.model.is_empty() {
                req.model = provider.default_model().to_string();
            }

            match self.breakers.try_acquire(name) {
                Admission::Rejected => {
                    debug!(provider = %name, "circuit open, advancing to next provider");
                    self.log_circuit_open(&*provider, &req.model, query.task);
                    last_err = FlowError::CircuitOpen {
                        provider: name.clone(),
                    };
                    continue;
                }
                Admission::Allowed | Admission::Probe => {}
            }

            match self.call_with_retry(&*provider, &req).await {
                Ok((generation, latency_ms)) => {
                    self.breakers.record_success(name);
                    self.health.record(name, true, latency_ms);
                    let mut log = ApiCallLog::success(
                        name,
                        &req.model,
                        provider.endpoint(),
                        query.task,
                        generation.usage,
                        latency_ms,
                        generation.cost_usd,
                    );
                    log.cache_hit = generation.cache_hit;
                    self.usage.record(log);
                    return Ok(generation);
                }
                Err((e, latency_ms)) => {
                    self.breakers.record_failure(name, breaker_counts(&e));
                    self.health.record(name, false, latency_ms);
                    self.usage.record(ApiCallLog::failure(
                        name,
                        &req.model,
                        provider.endpoint(),
                        query.task,
                        TokenUsage::default(),
                        latency_ms,
                        e.code(),
                    ));
                    warn!(provider = %name, error = %e, "provider failed after retries, advancing");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Retry loop for one provider. Returns the terminal outcome together
    /// with the latency of the deciding attempt.
    async fn call_with_retry(
        &self,
        provider: &dyn LlmProvider,
        request: &GenerateRequest,
    ) -> std::result::Result<(Generation, u64), (FlowError, u64)> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            match provider.generate(request).await {
                Ok(generation) => {
                    return Ok((generation, started.elapsed().as_millis() as u64));
                }
                Err(e) if is_retryable(&e) && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, retry_after_hint(&e));
                    warn!(
                        provider = provider.name(),
                        attempt = attempt + 1,
                        max = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err((e, started.elapsed().as_millis() as u64));
                }
            }
        }
    }

    /// Streaming generation. A retry (or failover to the next provider in
    /// the chain) is permitted only before the first chunk has been
    /// delivered; after that, a mid-stream failure terminates the stream
    /// with an error chunk. Two partial streams are never spliced.
    pub async fn generate_stream(
        &self,
        query: &RouteQuery,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        let chain = self.router.chain(query)?;
        let (out_tx, out_rx) = mpsc::channel(256);
        let mut last_err = FlowError::NoProviderAvailable;

        for name in &chain {
            let provider = self
                .router
                .get(name)
                .ok_or_else(|| FlowError::ProviderNotFound(name.clone()))?;
            let mut req = request.clone();
            if req.model.is_empty() {
                req.model = provider.default_model().to_string();
            }

            match self.breakers.try_acquire(name) {
                Admission::Rejected => {
                    self.log_circuit_open(&*provider, &req.model, query.task);
                    last_err = FlowError::CircuitOpen {
                        provider: name.clone(),
                    };
                    continue;
                }
                Admission::Allowed | Admission::Probe => {}
            }

            let mut attempt = 0u32;
            let outcome = loop {
                let started = Instant::now();
                let open_result = match provider.generate_stream(&req).await {
                    Ok(mut rx) => match rx.recv().await {
                        Some(TokenChunk::Error(e)) => Err(e),
                        Some(first) => Ok((first, rx)),
                        None => Err(FlowError::Protocol("stream closed without chunks".into())),
                    },
                    Err(e) => Err(e),
                };

                match open_result {
                    Ok((first, rx)) => break Ok((first, rx, started)),
                    Err(e) if is_retryable(&e) && attempt + 1 < self.retry.max_attempts => {
                        let delay = self.retry.delay(attempt, retry_after_hint(&e));
                        warn!(
                            provider = provider.name(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying stream before first token"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => break Err((e, started)),
                }
            };

            match outcome {
                Ok((first, rx, started)) => {
                    // Committed: from here on the stream either completes or
                    // surfaces a terminal error chunk.
                    self.spawn_relay(
                        name.clone(),
                        provider.endpoint().to_string(),
                        req.model.clone(),
                        query.task,
                        first,
                        rx,
                        out_tx,
                        started,
                    );
                    return Ok(out_rx);
                }
                Err((e, started)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.breakers.record_failure(name, breaker_counts(&e));
                    self.health.record(name, false, latency_ms);
                    self.usage.record(ApiCallLog::failure(
                        name,
                        &req.model,
                        provider.endpoint(),
                        query.task,
                        TokenUsage::default(),
                        latency_ms,
                        e.code(),
                    ));
                    warn!(provider = %name, error = %e, "stream open failed, advancing");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_relay(
        &self,
        provider: String,
        endpoint: String,
        model: String,
        task: TaskClass,
        first: TokenChunk,
        mut rx: mpsc::Receiver<TokenChunk>,
        out_tx: mpsc::Sender<TokenChunk>,
        started: Instant,
    ) {
        let breakers = Arc::clone(&self.breakers);
        let health = Arc::clone(&self.health);
        let usage_sink = Arc::clone(&self.usage);

        tokio::spawn(async move {
            let mut pending = Some(first);
            let mut final_usage = TokenUsage::default();
            let mut final_cost = 0.0f64;
            // When the downstream consumer goes away we keep draining the
            // provider stream so the breaker sees its real outcome.
            let mut forwarding = true;

            loop {
                let chunk = match pending.take() {
                    Some(chunk) => chunk,
                    None => match rx.recv().await {
                        Some(chunk) => chunk,
                        None => {
                            // Provider task ended without a terminator.
                            let latency_ms = started.elapsed().as_millis() as u64;
                            breakers.record_failure(&provider, true);
                            health.record(&provider, false, latency_ms);
                            usage_sink.record(ApiCallLog::failure(
                                &provider,
                                &model,
                                &endpoint,
                                task,
                                TokenUsage::default(),
                                latency_ms,
                                "protocol_error",
                            ));
                            if forwarding {
                                let _ = out_tx
                                    .send(TokenChunk::Error(FlowError::Protocol(
                                        "stream ended without terminator".into(),
                                    )))
                                    .await;
                            }
                            return;
                        }
                    },
                };

                match chunk {
                    TokenChunk::Token(text) => {
                        if forwarding && out_tx.send(TokenChunk::Token(text)).await.is_err() {
                            forwarding = false;
                        }
                    }
                    TokenChunk::Usage { usage, cost_usd } => {
                        final_usage = usage;
                        final_cost = cost_usd;
                        if forwarding
                            && out_tx
                                .send(TokenChunk::Usage { usage, cost_usd })
                                .await
                                .is_err()
                        {
                            forwarding = false;
                        }
                    }
                    TokenChunk::End => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        breakers.record_success(&provider);
                        health.record(&provider, true, latency_ms);
                        usage_sink.record(ApiCallLog::success(
                            &provider,
                            &model,
                            &endpoint,
                            task,
                            final_usage,
                            latency_ms,
                            final_cost,
                        ));
                        if forwarding {
                            let _ = out_tx.send(TokenChunk::End).await;
                        }
                        return;
                    }
                    TokenChunk::Error(e) => {
                        // Mid-stream failure: already-delivered tokens are
                        // not rolled back, and the error is made visible.
                        let latency_ms = started.elapsed().as_millis() as u64;
                        breakers.record_failure(&provider, breaker_counts(&e));
                        health.record(&provider, false, latency_ms);
                        usage_sink.record(ApiCallLog::failure(
                            &provider,
                            &model,
                            &endpoint,
                            task,
                            TokenUsage::default(),
                            latency_ms,
                            e.code(),
                        ));
                        if forwarding {
                            let _ = out_tx.send(TokenChunk::Error(e)).await;
                        }
                        return;
                    }
                }
            }
        });
    }
}
