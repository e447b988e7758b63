use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use leadflow_bus::memory::MemoryBus;
use leadflow_config::{AgentsConfig, BreakerConfig, RouterConfig, StreamConfig};
use leadflow_core::{
    ChunkBody, ExecutionStatus, LogTraceSink, StreamMode, TaskClass, UsageSink,
};
use leadflow_llm::{
    BreakerRegistry, HealthTracker, MockProvider, MockResponse, ProviderRouter,
    RecordingUsageSink, ResilientClient, RetryPolicy,
};
use leadflow_runtime::agents::{builtin_agents, builtin_tools};
use leadflow_runtime::{AgentRuntime, InvokeOptions};
use leadflow_store::{Repository, SqliteStore};
use leadflow_stream::StreamFabric;

struct Harness {
    runtime: Arc<AgentRuntime>,
    usage: Arc<RecordingUsageSink>,
    repo: Arc<SqliteStore>,
}

fn harness(providers: Vec<MockProvider>) -> Harness {
    harness_shared(providers.into_iter().map(Arc::new).collect())
}

fn harness_shared(providers: Vec<Arc<MockProvider>>) -> Harness {
    harness_with_config(providers, AgentsConfig::default())
}

fn harness_with_config(providers: Vec<Arc<MockProvider>>, config: AgentsConfig) -> Harness {
    let repo = Arc::new(SqliteStore::open_in_memory().unwrap());
    let bus = Arc::new(MemoryBus::new());
    let usage = Arc::new(RecordingUsageSink::new());

    let breakers = Arc::new(BreakerRegistry::new(&BreakerConfig::default()));
    let health = Arc::new(HealthTracker::new());
    let mut router = ProviderRouter::new(
        &RouterConfig::default(),
        Arc::clone(&breakers),
        Arc::clone(&health),
    );
    for provider in providers {
        router.add_provider(provider);
    }
    let client = Arc::new(ResilientClient::new(
        router,
        breakers,
        health,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        Arc::clone(&usage) as Arc<dyn UsageSink>,
    ));

    let fabric = Arc::new(StreamFabric::new(
        Arc::clone(&bus) as _,
        &StreamConfig::default(),
    ));
    let tools = Arc::new(builtin_tools());
    let mut runtime = AgentRuntime::new(
        client,
        Arc::clone(&tools),
        Arc::clone(&repo) as _,
        fabric,
        Arc::new(LogTraceSink),
        config,
    );
    for (name, kind) in builtin_agents(&tools).unwrap() {
        runtime.register_agent(&name, kind);
    }
    Harness {
        runtime: Arc::new(runtime),
        usage,
        repo,
    }
}

fn qualification_reply() -> String {
    json!({ "score": 85, "tier": "hot", "rationale": "strong industry fit" }).to_string()
}

// ── Linear agents ──────────────────────────────────────────────

#[tokio::test]
async fn qualification_happy_path() {
    let h = harness(vec![
        MockProvider::new("groq").with_response(&qualification_reply()),
    ]);

    let result = h
        .runtime
        .invoke_agent(
            "qualification",
            json!({ "company_name": "Acme", "industry": "SaaS", "company_size": "50-200" }),
            InvokeOptions {
                max_latency_ms: Some(1_000),
                stream_mode: StreamMode::Messages,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    let output = result.result.unwrap();
    assert_eq!(output["score"], 85);
    assert_eq!(output["tier"], "hot");

    // One audit row: fast/cheap provider, success.
    let rows = h.usage.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].provider, "groq");
    assert!(rows[0].success);
    assert_eq!(rows[0].operation, TaskClass::Qualification);

    // Execution row is terminal exactly once.
    let exec = h
        .repo
        .get_execution(result.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
    assert!(exec.ended_at.is_some());
}

#[tokio::test]
async fn invalid_structured_output_is_reprompted() {
    let h = harness(vec![
        MockProvider::new("groq")
            .with_response("this is not json at all")
            .with_response(&qualification_reply()),
    ]);

    let result = h
        .runtime
        .invoke_agent(
            "qualification",
            json!({ "company_name": "Acme" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    // Both the bad attempt and the corrective reprompt hit the provider.
    assert_eq!(h.usage.rows().len(), 2);
}

#[tokio::test]
async fn persistent_schema_violations_surface_as_bad_request() {
    let h = harness(vec![
        MockProvider::new("groq")
            .with_response("still not json")
            .with_response("nope")
            .with_response("nope again"),
    ]);

    let err = h
        .runtime
        .invoke_agent(
            "qualification",
            json!({ "company_name": "Acme" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_request");

    // The execution ended failed, exactly once.
    let rows = h.usage.rows();
    assert_eq!(rows.len(), 3);
}

// ── Streaming & cancellation ───────────────────────────────────

#[tokio::test]
async fn conversation_streams_tokens_then_completes() {
    let groq = MockProvider::new("groq");
    groq.queue_response(MockResponse::text("Hello there how can I help"));
    let h = harness(vec![groq]);

    let (stream_id, mut rx) = h
        .runtime
        .stream_agent(
            "conversation",
            json!({ "user_input": "Hi" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap();

    let mut tokens = 0;
    let mut terminal = None;
    let mut after_terminal = 0;
    while let Some(chunk) = rx.recv().await {
        if terminal.is_some() {
            after_terminal += 1;
        }
        match chunk.body {
            ChunkBody::Token { .. } => tokens += 1,
            ChunkBody::Complete { result } => terminal = Some(result),
            ChunkBody::Error { code, .. } => panic!("unexpected error chunk: {code}"),
            ChunkBody::Event { .. } => {}
        }
    }
    assert_eq!(tokens, 6);
    assert_eq!(after_terminal, 0);
    let reply = terminal.unwrap();
    assert!(reply["reply"].as_str().unwrap().contains("Hello"));

    let exec = h.repo.get_execution(stream_id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn cancellation_mid_stream_ends_with_exactly_one_cancelled_chunk() {
    let groq = MockProvider::new("groq");
    groq.queue_response(MockResponse::slow_stream(
        "one two three four five six seven eight nine ten",
        20,
    ));
    let h = harness(vec![groq]);

    let (stream_id, mut rx) = h
        .runtime
        .stream_agent(
            "conversation",
            json!({ "user_input": "Hi" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap();

    // Read a couple of tokens, then cancel.
    let mut received = Vec::new();
    for _ in 0..2 {
        received.push(rx.recv().await.unwrap());
    }
    h.runtime.cancel(stream_id).unwrap();

    let mut cancelled_chunks = 0;
    let mut after_terminal = 0;
    while let Some(chunk) = rx.recv().await {
        if cancelled_chunks > 0 {
            after_terminal += 1;
        }
        if let ChunkBody::Error { code, .. } = &chunk.body {
            assert_eq!(code, "cancelled");
            cancelled_chunks += 1;
        }
    }
    assert_eq!(cancelled_chunks, 1);
    assert_eq!(after_terminal, 0);

    // Give terminal bookkeeping a beat, then check the row.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let exec = h.repo.get_execution(stream_id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn deadline_expiry_fails_the_execution() {
    let groq = MockProvider::new("groq");
    groq.queue_response(MockResponse::slow_stream(
        "a b c d e f g h i j k l m n o p",
        50,
    ));
    let h = harness(vec![groq]);

    let err = h
        .runtime
        .invoke_agent(
            "conversation",
            json!({ "user_input": "Hi" }),
            InvokeOptions {
                deadline_ms: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "deadline_exceeded");
}

// ── Graph agents ───────────────────────────────────────────────

fn growth_research(confidence: f64) -> String {
    json!({ "insights": [format!("insight at {confidence}")], "confidence": confidence })
        .to_string()
}

fn growth_validate(confidence: f64) -> String {
    json!({ "confidence": confidence }).to_string()
}

#[tokio::test]
async fn growth_loops_until_confident_then_synthesizes() {
    let deepseek = MockProvider::new("deepseek")
        .with_response(&growth_research(0.4))
        .with_response(&growth_validate(0.5)) // below the bar: loop again
        .with_response(&growth_research(0.6))
        .with_response(&growth_validate(0.9)) // clears the bar
        .with_response(&json!({ "report": "## Growth brief" }).to_string());
    let h = harness(vec![deepseek]);

    let result = h
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    let state = result.result.unwrap();
    assert_eq!(state["report"], "## Growth brief");
    // Two research rounds accumulated under the append rule.
    assert_eq!(state["insights"].as_array().unwrap().len(), 2);
    assert_eq!(h.usage.rows().len(), 5);
}

#[tokio::test]
async fn recursion_limit_fails_but_keeps_partial_state() {
    // Confidence never clears the bar: research/validate alternate until
    // the step cap.
    let deepseek = MockProvider::new("deepseek");
    for _ in 0..13 {
        deepseek.queue_response(MockResponse::text(&growth_research(0.3)));
        deepseek.queue_response(MockResponse::text(&growth_validate(0.3)));
    }
    let h = harness(vec![deepseek]);

    let err = h
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "recursion_exhausted");

    // One audit row per provider call actually made (25 node steps,
    // every one an LLM call).
    assert_eq!(h.usage.rows().len(), 25);
}

#[tokio::test]
async fn recursion_limit_checkpoint_retains_insights() {
    let deepseek = MockProvider::new("deepseek");
    for _ in 0..13 {
        deepseek.queue_response(MockResponse::text(&growth_research(0.2)));
        deepseek.queue_response(MockResponse::text(&growth_validate(0.2)));
    }
    let h = harness(vec![deepseek]);

    // Invoke with a pinned execution id so the checkpoint is findable.
    let execution_id = uuid::Uuid::new_v4();
    let err = h
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions {
                checkpoint_id: Some(execution_id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "recursion_exhausted");

    let state = h.runtime.get_execution_state(execution_id).await.unwrap();
    assert_eq!(state.execution.status, ExecutionStatus::Failed);
    let checkpoint = state.checkpoint.unwrap();
    let insights = checkpoint.state["values"]["insights"].as_array().unwrap();
    assert!(!insights.is_empty());
}

#[tokio::test]
async fn replaying_after_node_failure_reaches_the_same_terminal_state() {
    // Clean run for the expected result.
    let clean = harness(vec![
        MockProvider::new("deepseek")
            .with_response(&growth_research(0.5))
            .with_response(&growth_validate(0.9))
            .with_response(&json!({ "report": "brief" }).to_string()),
    ]);
    let expected = clean
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions::default(),
        )
        .await
        .unwrap()
        .result
        .unwrap();

    // Failing run: validate dies with an auth error after research.
    let deepseek = Arc::new(
        MockProvider::new("deepseek")
            .with_response(&growth_research(0.5))
            .with_error(leadflow_llm::MockError::Auth),
    );
    let h = harness_shared(vec![Arc::clone(&deepseek)]);

    let execution_id = uuid::Uuid::new_v4();
    let err = h
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions {
                checkpoint_id: Some(execution_id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "auth_error");
    let calls_before_replay = deepseek.request_count();

    // Replay with the same checkpoint id: the checkpoint already holds
    // research's delta, so only validate onwards re-runs.
    deepseek.queue_response(MockResponse::text(&growth_validate(0.9)));
    deepseek.queue_response(MockResponse::text(
        &json!({ "report": "brief" }).to_string(),
    ));

    let replay = h
        .runtime
        .invoke_agent(
            "growth",
            json!({ "company_name": "Acme" }),
            InvokeOptions {
                checkpoint_id: Some(execution_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Same terminal state as the clean run that never failed.
    let replayed = replay.result.unwrap();
    assert_eq!(replayed["report"], expected["report"]);
    assert_eq!(replayed["insights"], expected["insights"]);

    // Research was not re-run: the replay consumed exactly the two
    // queued replies (validate + synthesize).
    assert_eq!(deepseek.request_count(), calls_before_replay + 2);
}
