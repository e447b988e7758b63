//! # leadflow-store
//!
//! Abstract repository over the relational store, plus the SQLite
//! implementation used in production and tests. Every record type from
//! the core data model is persisted here; the usage tracker's grouped
//! time-range queries live behind the same trait.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use leadflow_core::{
    AgentExecution, ApiCallLog, Checkpoint, CrmContact, CrmCredential, Interval, Lead, Result,
    SyncDirection, SyncResult, UsageBucket,
};

pub use sqlite::SqliteStore;

/// CRUD plus the grouped queries the usage tracker and sync engine need.
/// Transactions are per-call.
#[async_trait]
pub trait Repository: Send + Sync {
    // ── Leads ──────────────────────────────────────────────────
    /// Insert or replace a lead. Rejects qualification scores outside
    /// [0,100] and `updated_at < created_at`.
    async fn upsert_lead(&self, lead: &Lead) -> Result<()>;
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>>;

    // ── Provider call audit ────────────────────────────────────
    async fn insert_call_logs(&self, logs: &[ApiCallLog]) -> Result<()>;
    async fn call_logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<ApiCallLog>>;
    async fn usage_buckets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        provider: Option<&str>,
    ) -> Result<Vec<UsageBucket>>;
    async fn cost_by_provider(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>>;

    // ── Agent executions ───────────────────────────────────────
    async fn insert_execution(&self, exec: &AgentExecution) -> Result<()>;
    /// Update an execution. Once a terminal status has been written the
    /// row is frozen; a late update returns `Ok(false)`.
    async fn update_execution(&self, exec: &AgentExecution) -> Result<bool>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<AgentExecution>>;

    // ── Checkpoints ────────────────────────────────────────────
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Latest checkpoint for an execution, ignoring any older than
    /// `max_age`.
    async fn latest_checkpoint(
        &self,
        execution_id: Uuid,
        max_age: Duration,
    ) -> Result<Option<Checkpoint>>;
    async fn purge_checkpoints(&self, max_age: Duration) -> Result<u64>;

    // ── CRM mirror ─────────────────────────────────────────────
    async fn get_contact(&self, platform: &str, external_id: &str) -> Result<Option<CrmContact>>;
    /// Insert or update by `(platform, external_id)`. Returns true when a
    /// new row was created.
    async fn upsert_contact(&self, contact: &CrmContact) -> Result<bool>;
    async fn contacts_updated_since(
        &self,
        platform: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CrmContact>>;

    async fn put_credential(&self, credential: &CrmCredential) -> Result<()>;
    async fn get_credential(&self, tenant: &str, platform: &str)
    -> Result<Option<CrmCredential>>;

    // ── Sync runs ──────────────────────────────────────────────
    async fn insert_sync_log(&self, result: &SyncResult) -> Result<()>;
    async fn update_sync_log(&self, result: &SyncResult) -> Result<()>;
    async fn sync_history(&self, platform: Option<&str>, limit: usize) -> Result<Vec<SyncResult>>;
    async fn latest_sync(
        &self,
        platform: &str,
        direction: SyncDirection,
    ) -> Result<Option<SyncResult>>;
}
