use std::sync::Arc;
use std::time::Duration;

use leadflow_config::{BreakerConfig, RouterConfig};
use leadflow_core::{TaskClass, UsageSink};
use leadflow_llm::{
    BreakerRegistry, GenerateRequest, HealthTracker, MockError, MockProvider, MockResponse,
    ProviderRouter, RecordingUsageSink, ResilientClient, RetryPolicy, RouteQuery, TokenChunk,
};

struct Harness {
    client: ResilientClient,
    usage: Arc<RecordingUsageSink>,
    breakers: Arc<BreakerRegistry>,
}

fn harness(providers: Vec<MockProvider>) -> Harness {
    let breakers = Arc::new(BreakerRegistry::new(&BreakerConfig {
        failure_threshold: 5,
        recovery_timeout_secs: 3600,
    }));
    let health = Arc::new(HealthTracker::new());
    let usage = Arc::new(RecordingUsageSink::new());

    let mut router = ProviderRouter::new(
        &RouterConfig::default(),
        Arc::clone(&breakers),
        Arc::clone(&health),
    );
    for provider in providers {
        router.add_provider(Arc::new(provider));
    }

    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
    };
    let client = ResilientClient::new(
        router,
        Arc::clone(&breakers),
        health,
        retry,
        Arc::clone(&usage) as Arc<dyn UsageSink>,
    );
    Harness {
        client,
        usage,
        breakers,
    }
}

fn request() -> GenerateRequest {
    GenerateRequest::new("", "Qualify this lead")
}

#[tokio::test]
async fn happy_path_records_one_success_row() {
    let h = harness(vec![
        MockProvider::new("groq").with_response(r#"{"score":85,"tier":"hot"}"#)
    ]);

    let out = h
        .client
        .generate(&RouteQuery::for_task(TaskClass::Qualification), &request())
        .await
        .unwrap();
    assert!(out.content.contains("85"));

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].provider, "groq");
    assert!(rows[0].success);
    assert_eq!(
        rows[0].total_tokens,
        rows[0].prompt_tokens + rows[0].completion_tokens
    );
    assert!(rows[0].cost_usd > 0.0);
}

#[tokio::test]
async fn transient_error_is_retried_on_same_provider() {
    let groq = MockProvider::new("groq")
        .with_error(MockError::RateLimited)
        .with_response("recovered");
    let h = harness(vec![groq]);

    let out = h
        .client
        .generate(&RouteQuery::for_task(TaskClass::Qualification), &request())
        .await
        .unwrap();
    assert_eq!(out.content, "recovered");

    // Retries are not terminal outcomes: exactly one (success) row.
    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
}

#[tokio::test]
async fn auth_error_is_never_retried() {
    let groq = MockProvider::new("groq").with_error(MockError::Auth);
    let requests = groq.recorded_requests();
    let h = harness(vec![groq]);

    let err = h
        .client
        .generate(&RouteQuery::for_task(TaskClass::Qualification), &request())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "auth_error");
    assert_eq!(requests.lock().unwrap().len(), 1);

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error.as_deref(), Some("auth_error"));
}

#[tokio::test]
async fn failover_records_one_row_per_provider() {
    // groq exhausts retries on upstream errors, anthropic answers.
    let groq = MockProvider::new("groq")
        .with_error(MockError::Upstream)
        .with_error(MockError::Upstream)
        .with_error(MockError::Upstream);
    let anthropic = MockProvider::new("anthropic").with_response("high quality answer");
    let h = harness(vec![groq, anthropic]);

    let out = h
        .client
        .generate(&RouteQuery::for_task(TaskClass::Enrichment), &request())
        .await
        .unwrap();
    assert_eq!(out.content, "high quality answer");

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].provider, "groq");
    assert!(!rows[0].success);
    assert_eq!(rows[0].error.as_deref(), Some("upstream_unavailable"));
    assert_eq!(rows[1].provider, "anthropic");
    assert!(rows[1].success);
}

#[tokio::test]
async fn circuit_open_fast_fail_is_logged() {
    let groq = MockProvider::new("groq");
    let requests = groq.recorded_requests();
    let h = harness(vec![groq]);

    // Trip the breaker with protocol errors (counted, not retried).
    h.breakers.record_failure("groq", true);
    h.breakers.record_failure("groq", true);
    h.breakers.record_failure("groq", true);
    h.breakers.record_failure("groq", true);
    h.breakers.record_failure("groq", true);

    // The router degrades to the only candidate; admission then fast-fails.
    let err = h
        .client
        .generate(&RouteQuery::for_task(TaskClass::Qualification), &request())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "circuit_open");
    // The provider itself was never called.
    assert_eq!(requests.lock().unwrap().len(), 0);

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
    assert_eq!(rows[0].error.as_deref(), Some("circuit_open"));
    assert_eq!(rows[0].total_tokens, 0);
}

#[tokio::test]
async fn streaming_happy_path_records_usage() {
    let groq = MockProvider::new("groq").with_response("Hi there friend");
    let h = harness(vec![groq]);

    let mut rx = h
        .client
        .generate_stream(&RouteQuery::for_task(TaskClass::Conversation), &request())
        .await
        .unwrap();

    let mut tokens = Vec::new();
    let mut ended = false;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            TokenChunk::Token(t) => tokens.push(t),
            TokenChunk::End => ended = true,
            TokenChunk::Usage { .. } => {}
            TokenChunk::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(tokens.len(), 3);
    assert!(ended);

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert!(rows[0].total_tokens > 0);
}

#[tokio::test]
async fn stream_retry_is_allowed_before_first_token() {
    let groq = MockProvider::new("groq");
    groq.queue_response(MockResponse::error(MockError::Upstream));
    groq.queue_response(MockResponse::text("second attempt works"));
    let requests = groq.recorded_requests();
    let h = harness(vec![groq]);

    let mut rx = h
        .client
        .generate_stream(&RouteQuery::for_task(TaskClass::Conversation), &request())
        .await
        .unwrap();

    let mut text = String::new();
    while let Some(chunk) = rx.recv().await {
        if let TokenChunk::Token(t) = chunk {
            text.push_str(&t);
        }
    }
    assert_eq!(text.trim(), "second attempt works");
    assert_eq!(requests.lock().unwrap().len(), 2);

    // The pre-first-token failure was retried, not terminal: one row.
    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
}

#[tokio::test]
async fn mid_stream_failure_is_terminal_not_retried() {
    let groq = MockProvider::new("groq").with_mock_response(MockResponse::fails_mid_stream(
        "Hi there partial answer",
        2,
        MockError::Upstream,
    ));
    let requests = groq.recorded_requests();
    let h = harness(vec![groq]);

    let mut rx = h
        .client
        .generate_stream(&RouteQuery::for_task(TaskClass::Conversation), &request())
        .await
        .unwrap();

    let mut tokens = 0;
    let mut terminal_error = None;
    let mut chunks_after_error = 0;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            TokenChunk::Token(_) => {
                if terminal_error.is_some() {
                    chunks_after_error += 1;
                } else {
                    tokens += 1;
                }
            }
            TokenChunk::Error(e) => terminal_error = Some(e),
            _ => {
                if terminal_error.is_some() {
                    chunks_after_error += 1;
                }
            }
        }
    }

    // Delivered tokens are not rolled back; the failure is visible; no
    // second stream is spliced in.
    assert_eq!(tokens, 2);
    assert_eq!(terminal_error.unwrap().code(), "upstream_unavailable");
    assert_eq!(chunks_after_error, 0);
    assert_eq!(requests.lock().unwrap().len(), 1);

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
    assert_eq!(rows[0].completion_tokens, 0);
}

#[tokio::test]
async fn breaker_opens_after_consecutive_terminal_failures() {
    let groq = MockProvider::new("groq")
        .with_error(MockError::Protocol)
        .with_error(MockError::Protocol)
        .with_error(MockError::Protocol)
        .with_error(MockError::Protocol)
        .with_error(MockError::Protocol);
    let h = harness(vec![groq]);
    let query = RouteQuery::for_task(TaskClass::Qualification);

    for _ in 0..5 {
        let err = h.client.generate(&query, &request()).await.unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }
    assert!(h.breakers.is_open("groq"));

    // Next call fast-fails without touching the provider.
    let err = h.client.generate(&query, &request()).await.unwrap_err();
    assert_eq!(err.code(), "circuit_open");

    let rows = h.usage.rows();
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[5].error.as_deref(), Some("circuit_open"));
}
