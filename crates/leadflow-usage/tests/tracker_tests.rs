use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use leadflow_bus::{Bus, memory::MemoryBus};
use leadflow_config::UsageConfig;
use leadflow_core::{ApiCallLog, Interval, TaskClass, TokenUsage, UsageSink};
use leadflow_store::SqliteStore;
use leadflow_usage::{REALTIME_CACHE_KEY, UsageTracker};

fn success_log(provider: &str, latency_ms: u64, cost: f64) -> ApiCallLog {
    ApiCallLog::success(
        provider,
        "model",
        "/chat",
        TaskClass::Qualification,
        TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        },
        latency_ms,
        cost,
    )
}

fn tracker() -> (UsageTracker, Arc<MemoryBus>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let bus = Arc::new(MemoryBus::new());
    let tracker = UsageTracker::new(store, Arc::clone(&bus) as _, &UsageConfig::default());
    (tracker, bus)
}

#[tokio::test]
async fn record_persists_through_background_writer() {
    let (tracker, _bus) = tracker();
    tracker.record(success_log("groq", 700, 0.001));
    tracker.record(success_log("anthropic", 3500, 0.03));
    tracker.flush().await;

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);
    let costs = tracker.cost_by_provider(start, end).await.unwrap();
    assert_eq!(costs.len(), 2);
    assert!((costs["anthropic"] - 0.03).abs() < 1e-9);
}

#[tokio::test]
async fn realtime_metrics_cached_and_invalidated_on_write() {
    let (tracker, bus) = tracker();
    tracker.record(success_log("groq", 100, 0.001));
    tracker.flush().await;

    let first = tracker.real_time_metrics().await.unwrap();
    assert_eq!(first.total_calls, 1);
    // The summary is now cached on the bus.
    assert!(bus.get(REALTIME_CACHE_KEY).await.unwrap().is_some());

    // A new write invalidates the cache...
    tracker.record(success_log("groq", 100, 0.001));
    tracker.flush().await;
    assert!(bus.get(REALTIME_CACHE_KEY).await.unwrap().is_none());

    // ...so the next read recomputes and sees the new row.
    let second = tracker.real_time_metrics().await.unwrap();
    assert_eq!(second.total_calls, 2);
}

#[tokio::test]
async fn metrics_include_failures_and_percentiles() {
    let (tracker, _bus) = tracker();
    tracker.record(success_log("groq", 100, 0.001));
    tracker.record(success_log("groq", 200, 0.001));
    tracker.record(ApiCallLog::failure(
        "groq",
        "model",
        "/chat",
        TaskClass::Qualification,
        TokenUsage::default(),
        50,
        "upstream_unavailable",
    ));
    tracker.flush().await;

    let metrics = tracker.real_time_metrics().await.unwrap();
    assert_eq!(metrics.total_calls, 3);
    assert!((metrics.success_rate_pct - 66.666).abs() < 0.01);
    assert!(metrics.latency.p50_ms >= 50);
    let groq = &metrics.by_provider["groq"];
    assert_eq!(groq.calls, 3);

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);
    let rate = tracker.success_rate(start, end, Some("groq")).await.unwrap();
    assert!((rate - 66.666).abs() < 0.01);

    let p = tracker
        .latency_percentiles(start, end, None)
        .await
        .unwrap();
    assert_eq!(p.p50_ms, 100);
}

#[tokio::test]
async fn aggregates_bucket_by_interval() {
    let (tracker, _bus) = tracker();
    for _ in 0..3 {
        tracker.record(success_log("groq", 100, 0.002));
    }
    tracker.flush().await;

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);
    let buckets = tracker
        .aggregates(start, end, Interval::Hour, None)
        .await
        .unwrap();
    assert_eq!(buckets.iter().map(|b| b.calls).sum::<u64>(), 3);
    assert!(buckets[0].bucket.contains('T'));
}
