//! # leadflow-usage
//!
//! Authoritative record of every provider call. Writes go through an
//! unbounded channel to a background batcher so the caller's critical
//! path never blocks on the store; reads serve a cached 24-hour summary
//! invalidated on every write.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use leadflow_bus::Bus;
use leadflow_config::UsageConfig;
use leadflow_core::{
    ApiCallLog, Interval, LatencyPercentiles, ProviderSummary, RealtimeMetrics, Result,
    UsageBucket, UsageSink,
};
use leadflow_store::Repository;

/// Bus key holding the cached realtime summary.
pub const REALTIME_CACHE_KEY: &str = "usage:realtime:last24h";

enum WriterMessage {
    Log(Box<ApiCallLog>),
    /// Drain everything buffered, then ack. Used by tests and shutdown.
    Flush(oneshot::Sender<()>),
}

/// Usage tracker. Cloneable handle; the background writer lives as long
/// as any handle does.
#[derive(Clone)]
pub struct UsageTracker {
    tx: mpsc::UnboundedSender<WriterMessage>,
    repo: Arc<dyn Repository>,
    bus: Arc<dyn Bus>,
    cache_ttl: Duration,
}

impl UsageTracker {
    /// Create the tracker and spawn its background writer.
    pub fn new(repo: Arc<dyn Repository>, bus: Arc<dyn Bus>, config: &UsageConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_repo = Arc::clone(&repo);
        let writer_bus = Arc::clone(&bus);
        let batch_size = config.batch_size.max(1);
        let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
        tokio::spawn(writer_loop(
            rx,
            writer_repo,
            writer_bus,
            batch_size,
            flush_interval,
        ));
        Self {
            tx,
            repo,
            bus,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    /// Wait until everything recorded so far has been persisted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 24-hour summary, served from the bus cache when fresh.
    pub async fn real_time_metrics(&self) -> Result<RealtimeMetrics> {
        if let Some(cached) = self.bus.get(REALTIME_CACHE_KEY).await? {
            if let Ok(metrics) = serde_json::from_value::<RealtimeMetrics>(cached) {
                debug!("realtime metrics served from cache");
                return Ok(metrics);
            }
            // Unreadable cache entry: fall through and recompute.
            let _ = self.bus.delete(REALTIME_CACHE_KEY).await;
        }

        let end = Utc::now();
        let start = end - ChronoDuration::hours(24);
        let logs = self.repo.call_logs_between(start, end, None).await?;
        let metrics = summarize(&logs);

        self.bus
            .set(
                REALTIME_CACHE_KEY,
                serde_json::to_value(&metrics)?,
                Some(self.cache_ttl),
            )
            .await?;
        Ok(metrics)
    }

    /// Time-series buckets over a window.
    pub async fn aggregates(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        provider: Option<&str>,
    ) -> Result<Vec<UsageBucket>> {
        self.repo.usage_buckets(start, end, interval, provider).await
    }

    pub async fn cost_by_provider(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        self.repo.cost_by_provider(start, end).await
    }

    pub async fn latency_percentiles(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<LatencyPercentiles> {
        let logs = self.repo.call_logs_between(start, end, provider).await?;
        let latencies: Vec<u64> = logs.iter().map(|l| l.latency_ms).collect();
        Ok(percentiles(&latencies))
    }

    /// Success rate over a window, in percent.
    pub async fn success_rate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<f64> {
        let logs = self.repo.call_logs_between(start, end, provider).await?;
        if logs.is_empty() {
            return Ok(100.0);
        }
        let ok = logs.iter().filter(|l| l.success).count();
        Ok(ok as f64 / logs.len() as f64 * 100.0)
    }
}

impl UsageSink for UsageTracker {
    fn record(&self, log: ApiCallLog) {
        // Unbounded send: never blocks the caller. The writer owns
        // persistence and cache invalidation.
        if self.tx.send(WriterMessage::Log(Box::new(log))).is_err() {
            warn!("usage writer is gone, dropping audit row");
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    repo: Arc<dyn Repository>,
    bus: Arc<dyn Bus>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<ApiCallLog> = Vec::with_capacity(batch_size);
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let Some(first) = rx.recv().await else { break };
        match first {
            WriterMessage::Log(log) => batch.push(*log),
            WriterMessage::Flush(ack) => acks.push(ack),
        }

        // Gather until the batch fills, the interval elapses, or a flush
        // request arrives with nothing more queued.
        let deadline = tokio::time::sleep(flush_interval);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                msg = rx.recv() => match msg {
                    Some(WriterMessage::Log(log)) => batch.push(*log),
                    Some(WriterMessage::Flush(ack)) => {
                        acks.push(ack);
                        break;
                    }
                    None => break,
                },
            }
        }

        if !batch.is_empty() {
            if let Err(e) = repo.insert_call_logs(&batch).await {
                warn!(error = %e, rows = batch.len(), "failed to persist usage batch");
            }
            batch.clear();
            // Every write invalidates the cached realtime summary.
            if let Err(e) = bus.delete(REALTIME_CACHE_KEY).await {
                warn!(error = %e, "failed to invalidate usage cache");
            }
        }
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
    }
}

fn summarize(logs: &[ApiCallLog]) -> RealtimeMetrics {
    let mut metrics = RealtimeMetrics {
        computed_at: Utc::now(),
        ..Default::default()
    };
    if logs.is_empty() {
        metrics.success_rate_pct = 100.0;
        return metrics;
    }

    let mut latencies = Vec::with_capacity(logs.len());
    let mut successes = 0u64;
    let mut cache_hits = 0u64;
    let mut per_provider: HashMap<String, (u64, u64, u64, f64)> = HashMap::new();

    for log in logs {
        metrics.total_calls += 1;
        metrics.total_tokens += log.total_tokens as u64;
        metrics.total_cost_usd += log.cost_usd;
        latencies.push(log.latency_ms);
        if log.success {
            successes += 1;
        }
        if log.cache_hit {
            cache_hits += 1;
        }
        let entry = per_provider.entry(log.provider.clone()).or_default();
        entry.0 += 1;
        entry.1 += log.total_tokens as u64;
        if log.success {
            entry.2 += 1;
        }
        entry.3 += log.cost_usd;
    }

    metrics.success_rate_pct = successes as f64 / logs.len() as f64 * 100.0;
    metrics.cache_hit_rate_pct = cache_hits as f64 / logs.len() as f64 * 100.0;
    metrics.latency = percentiles(&latencies);
    metrics.by_provider = per_provider
        .into_iter()
        .map(|(provider, (calls, tokens, ok, cost))| {
            (
                provider,
                ProviderSummary {
                    calls,
                    total_tokens: tokens,
                    cost_usd: cost,
                    success_rate_pct: ok as f64 / calls as f64 * 100.0,
                },
            )
        })
        .collect();
    metrics
}

fn percentiles(latencies: &[u64]) -> LatencyPercentiles {
    if latencies.is_empty() {
        return LatencyPercentiles::default();
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let pick = |q: f64| -> u64 {
        let idx = ((sorted.len() as f64) * q).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    };
    LatencyPercentiles {
        p50_ms: pick(0.50),
        p95_ms: pick(0.95),
        p99_ms: pick(0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_edges() {
        assert_eq!(percentiles(&[]).p99_ms, 0);
        let p = percentiles(&[100]);
        assert_eq!((p.p50_ms, p.p95_ms, p.p99_ms), (100, 100, 100));

        let latencies: Vec<u64> = (1..=100).collect();
        let p = percentiles(&latencies);
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p95_ms, 95);
        assert_eq!(p.p99_ms, 99);
    }

    #[test]
    fn summary_of_empty_window_is_healthy() {
        let m = summarize(&[]);
        assert_eq!(m.total_calls, 0);
        assert_eq!(m.success_rate_pct, 100.0);
    }
}
