use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

use leadflow_core::{
    AgentExecution, ApiCallLog, Checkpoint, Company, Contact, CrmContact, ExecutionStatus,
    Interval, Lead, Qualification, SyncDirection, SyncResult, SyncStatus, TaskClass, Tier,
    TokenUsage,
};
use leadflow_store::{Repository, SqliteStore};

fn lead_with_score(score: u8) -> Lead {
    let mut lead = Lead::new(
        Company {
            name: "Acme".into(),
            website: Some("https://acme.test".into()),
            size: Some("50-200".into()),
            industry: Some("SaaS".into()),
        },
        Contact {
            email: Some("jane@acme.test".into()),
            ..Default::default()
        },
    );
    lead.qualification = Some(Qualification {
        score,
        tier: Tier::Hot,
        rationale: "strong fit".into(),
        latency_ms: 700,
        qualified_at: Utc::now(),
    });
    lead
}

#[tokio::test]
async fn lead_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let lead = lead_with_score(85);
    store.upsert_lead(&lead).await.unwrap();

    let loaded = store.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(loaded.company.name, "Acme");
    assert_eq!(loaded.qualification.unwrap().score, 85);
}

#[tokio::test]
async fn lead_score_out_of_range_rejected() {
    let store = SqliteStore::open_in_memory().unwrap();
    let lead = lead_with_score(120);
    let err = store.upsert_lead(&lead).await.unwrap_err();
    assert_eq!(err.code(), "bad_request");
}

#[tokio::test]
async fn call_log_invariants_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let usage = TokenUsage {
        prompt_tokens: 120,
        completion_tokens: 60,
    };
    let log = ApiCallLog::success(
        "groq",
        "llama-3.3-70b-versatile",
        "/chat/completions",
        TaskClass::Qualification,
        usage,
        700,
        0.00042,
    );
    store.insert_call_logs(&[log.clone()]).await.unwrap();

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);
    let logs = store.call_logs_between(start, end, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].total_tokens, 180);
    assert_eq!(
        logs[0].total_tokens,
        logs[0].prompt_tokens + logs[0].completion_tokens
    );
    assert!(logs[0].cost_usd >= 0.0);
}

#[tokio::test]
async fn zero_token_failure_still_logged() {
    let store = SqliteStore::open_in_memory().unwrap();
    let log = ApiCallLog::failure(
        "groq",
        "llama-3.3-70b-versatile",
        "/chat/completions",
        TaskClass::Conversation,
        TokenUsage::default(),
        0,
        "circuit_open",
    );
    store.insert_call_logs(&[log]).await.unwrap();

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);
    let logs = store
        .call_logs_between(start, end, Some("groq"))
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].total_tokens, 0);
    assert!(!logs[0].success);
    assert_eq!(logs[0].error.as_deref(), Some("circuit_open"));
}

#[tokio::test]
async fn usage_buckets_group_by_provider_and_interval() {
    let store = SqliteStore::open_in_memory().unwrap();
    let usage = TokenUsage {
        prompt_tokens: 10,
        completion_tokens: 5,
    };
    for provider in ["groq", "anthropic", "groq"] {
        let log = ApiCallLog::success(
            provider,
            "m",
            "/chat",
            TaskClass::Enrichment,
            usage,
            100,
            0.001,
        );
        store.insert_call_logs(&[log]).await.unwrap();
    }

    let start = Utc::now() - ChronoDuration::hours(1);
    let end = Utc::now() + ChronoDuration::hours(1);

    let all = store
        .usage_buckets(start, end, Interval::Day, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].calls, 3);

    let groq_only = store
        .usage_buckets(start, end, Interval::Day, Some("groq"))
        .await
        .unwrap();
    assert_eq!(groq_only[0].calls, 2);

    let costs = store.cost_by_provider(start, end).await.unwrap();
    assert!((costs["groq"] - 0.002).abs() < 1e-9);
    assert!((costs["anthropic"] - 0.001).abs() < 1e-9);
}

#[tokio::test]
async fn execution_terminal_status_is_written_once() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut exec = AgentExecution::dispatched("qualification", None);
    store.insert_execution(&exec).await.unwrap();

    exec.status = ExecutionStatus::Running;
    assert!(store.update_execution(&exec).await.unwrap());

    exec.status = ExecutionStatus::Success;
    exec.ended_at = Some(Utc::now());
    assert!(store.update_execution(&exec).await.unwrap());

    // A second terminal write is refused.
    exec.status = ExecutionStatus::Failed;
    exec.error = Some("late".into());
    assert!(!store.update_execution(&exec).await.unwrap());

    let loaded = store.get_execution(exec.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Success);
    assert!(loaded.error.is_none());
}

#[tokio::test]
async fn checkpoint_latest_and_ttl() {
    let store = SqliteStore::open_in_memory().unwrap();
    let execution_id = Uuid::new_v4();

    for step in 1..=3u32 {
        store
            .put_checkpoint(&Checkpoint {
                execution_id,
                step,
                state: serde_json::json!({ "step": step }),
                suspended: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let latest = store
        .latest_checkpoint(execution_id, Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.step, 3);

    // An aged checkpoint is treated as absent.
    let stale_id = Uuid::new_v4();
    store
        .put_checkpoint(&Checkpoint {
            execution_id: stale_id,
            step: 1,
            state: serde_json::json!({}),
            suspended: None,
            created_at: Utc::now() - ChronoDuration::hours(48),
        })
        .await
        .unwrap();
    assert!(
        store
            .latest_checkpoint(stale_id, Duration::from_secs(24 * 3600))
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(
        store
            .purge_checkpoints(Duration::from_secs(24 * 3600))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn contact_upsert_is_idempotent_per_external_id() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut contact = CrmContact {
        id: Uuid::new_v4(),
        platform: "hubspot".into(),
        external_id: "ext-1".into(),
        email: Some("a@x.com".into()),
        name: Some("Ada".into()),
        title: None,
        phone: None,
        company: None,
        fields: Default::default(),
        enrichment: None,
        last_synced_at: None,
        updated_at: Utc::now(),
    };

    assert!(store.upsert_contact(&contact).await.unwrap());
    contact.email = Some("b@x.com".into());
    // Same (platform, external_id): update, not a duplicate row.
    assert!(!store.upsert_contact(&contact).await.unwrap());

    let loaded = store
        .get_contact("hubspot", "ext-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.email.as_deref(), Some("b@x.com"));
}

#[tokio::test]
async fn sync_log_history_and_latest() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut run = SyncResult::begin("hubspot", SyncDirection::Bidirectional);
    store.insert_sync_log(&run).await.unwrap();

    run.status = SyncStatus::Completed;
    run.processed = 10;
    run.updated = 4;
    run.ended_at = Some(Utc::now());
    store.update_sync_log(&run).await.unwrap();

    let history = store.sync_history(Some("hubspot"), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].processed, 10);

    let latest = store
        .latest_sync("hubspot", SyncDirection::Bidirectional)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, SyncStatus::Completed);
    assert!(
        store
            .latest_sync("hubspot", SyncDirection::Import)
            .await
            .unwrap()
            .is_none()
    );
}
