use std::sync::Arc;
use std::time::Duration;

use leadflow_config::{BreakerConfig, RouterConfig};
use leadflow_core::TaskClass;
use leadflow_llm::{
    BreakerRegistry, Capability, HealthTracker, MockProvider, PricingRule, ProviderRouter,
    RouteQuery,
};

fn registry() -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(&BreakerConfig {
        failure_threshold: 1,
        recovery_timeout_secs: 3600,
    }))
}

fn router_with_defaults(
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthTracker>,
) -> ProviderRouter {
    let mut router = ProviderRouter::new(&RouterConfig::default(), breakers, health);
    router.add_provider(Arc::new(MockProvider::new("groq").with_pricing(
        PricingRule::PerTokenSplit {
            input_per_mtok: 0.59,
            output_per_mtok: 0.79,
        },
    )));
    router.add_provider(Arc::new(
        MockProvider::new("anthropic")
            .with_pricing(PricingRule::PerTokenSplit {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            })
            .with_capabilities(vec![Capability::Streaming, Capability::Vision]),
    ));
    router.add_provider(Arc::new(MockProvider::new("deepseek").with_pricing(
        PricingRule::PerTokenSplit {
            input_per_mtok: 0.27,
            output_per_mtok: 1.10,
        },
    )));
    router.add_provider(Arc::new(
        MockProvider::new("ollama").with_pricing(PricingRule::Free),
    ));
    router
}

#[tokio::test]
async fn task_defaults_drive_the_chain() {
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));

    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Enrichment))
        .unwrap();
    assert_eq!(chain, vec!["groq", "anthropic"]);

    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Marketing))
        .unwrap();
    assert_eq!(chain, vec!["anthropic"]);

    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Parsing))
        .unwrap();
    assert_eq!(chain, vec!["ollama", "groq"]);
}

#[tokio::test]
async fn identical_queries_produce_identical_chains() {
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));
    let query = RouteQuery::for_task(TaskClass::Conversation);
    assert_eq!(router.chain(&query).unwrap(), router.chain(&query).unwrap());
}

#[tokio::test]
async fn forced_provider_short_circuits() {
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));
    let mut query = RouteQuery::for_task(TaskClass::Qualification);
    query.forced_provider = Some("anthropic".into());
    assert_eq!(router.chain(&query).unwrap(), vec!["anthropic"]);
}

#[tokio::test]
async fn forced_provider_with_open_breaker_falls_through() {
    let breakers = registry();
    breakers.record_failure("anthropic", true);
    let router = router_with_defaults(Arc::clone(&breakers), Arc::new(HealthTracker::new()));

    let mut query = RouteQuery::for_task(TaskClass::Qualification);
    query.forced_provider = Some("anthropic".into());
    assert_eq!(router.chain(&query).unwrap(), vec!["groq"]);
}

#[tokio::test]
async fn open_breaker_is_filtered_out() {
    let breakers = registry();
    breakers.record_failure("groq", true);
    let router = router_with_defaults(Arc::clone(&breakers), Arc::new(HealthTracker::new()));

    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Enrichment))
        .unwrap();
    assert_eq!(chain, vec!["anthropic"]);
}

#[tokio::test]
async fn low_success_rate_is_filtered_out() {
    let health = Arc::new(HealthTracker::new());
    for _ in 0..10 {
        health.record("groq", false, 100);
    }
    health.record("groq", true, 100);
    let router = router_with_defaults(registry(), Arc::clone(&health));

    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Enrichment))
        .unwrap();
    assert_eq!(chain, vec!["anthropic"]);
}

#[tokio::test]
async fn latency_budget_filters_slow_providers() {
    let health = Arc::new(HealthTracker::new());
    for _ in 0..20 {
        health.record("groq", true, 5_000);
        health.record("anthropic", true, 400);
    }
    let router = router_with_defaults(registry(), Arc::clone(&health));

    let mut query = RouteQuery::for_task(TaskClass::Enrichment);
    query.max_latency_ms = Some(1_000);
    assert_eq!(router.chain(&query).unwrap(), vec!["anthropic"]);
}

#[tokio::test]
async fn cost_budget_orders_cost_ascending() {
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));
    let mut query = RouteQuery::for_task(TaskClass::Enrichment);
    query.max_cost_usd = Some(10.0);
    query.max_tokens = 1024;
    // groq is cheaper than anthropic, so it leads regardless of table order.
    assert_eq!(router.chain(&query).unwrap(), vec!["groq", "anthropic"]);
}

#[tokio::test]
async fn vision_requires_the_capability() {
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));
    let mut query = RouteQuery::for_task(TaskClass::Enrichment);
    query.required_capabilities = vec![Capability::Vision];
    assert_eq!(router.chain(&query).unwrap(), vec!["anthropic"]);
}

#[tokio::test]
async fn degrades_to_cheapest_when_everything_is_filtered() {
    let breakers = registry();
    breakers.record_failure("groq", true);
    breakers.record_failure("anthropic", true);
    let router = router_with_defaults(Arc::clone(&breakers), Arc::new(HealthTracker::new()));

    // Both enrichment candidates have open breakers; the router still
    // returns the cheapest so the retry layer decides the outcome.
    let chain = router
        .chain(&RouteQuery::for_task(TaskClass::Enrichment))
        .unwrap();
    assert_eq!(chain, vec!["groq"]);
}

#[tokio::test]
async fn unknown_provider_health_passes_filters() {
    // A provider with no recorded samples must not be filtered by the
    // success floor or the latency budget.
    let router = router_with_defaults(registry(), Arc::new(HealthTracker::new()));
    let mut query = RouteQuery::for_task(TaskClass::Enrichment);
    query.max_latency_ms = Some(100);
    let chain = router.chain(&query).unwrap();
    assert_eq!(chain, vec!["groq", "anthropic"]);
}

#[tokio::test]
async fn health_tracker_windows() {
    let health = HealthTracker::new();
    health.record("p", true, 100);
    health.record("p", true, 200);
    health.record("p", false, 300);
    assert!(
        (health
            .success_rate("p", Duration::from_secs(60))
            .unwrap()
            - 2.0 / 3.0)
            .abs()
            < 1e-9
    );
    // p95 over successes only
    assert_eq!(
        health.p95_latency_ms("p", Duration::from_secs(60)),
        Some(200)
    );
    assert_eq!(health.success_rate("unknown", Duration::from_secs(60)), None);
}
