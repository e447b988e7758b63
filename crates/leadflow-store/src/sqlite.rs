use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::Repository;
use leadflow_core::{
    AgentExecution, ApiCallLog, Checkpoint, CrmContact, CrmCredential, ExecutionStatus, FlowError,
    Interval, Lead, Result, SyncDirection, SyncResult, SyncStatus, TaskClass, UsageBucket,
};

fn store_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Store(e.to_string())
}

/// SQLite-backed [`Repository`].
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening store");

        let conn = Connection::open(path).map_err(store_err)?;

        // WAL for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                company TEXT NOT NULL,
                contact TEXT NOT NULL,
                qualification TEXT,
                qualification_score INTEGER,
                additional_data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_call_logs (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                operation TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                tenant_id TEXT,
                success INTEGER NOT NULL,
                error TEXT,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_logs_created ON api_call_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_call_logs_provider ON api_call_logs(provider, created_at);

            CREATE TABLE IF NOT EXISTS agent_executions (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                lead_id TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                latency_ms INTEGER,
                cost_usd REAL NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_status ON agent_executions(status);

            CREATE TABLE IF NOT EXISTS checkpoints (
                execution_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                state TEXT NOT NULL,
                suspended TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (execution_id, step)
            );

            CREATE TABLE IF NOT EXISTS crm_contacts (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                external_id TEXT NOT NULL,
                email TEXT,
                name TEXT,
                title TEXT,
                phone TEXT,
                company TEXT,
                fields TEXT NOT NULL DEFAULT '{}',
                enrichment TEXT,
                last_synced_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(platform, external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_updated ON crm_contacts(platform, updated_at);

            CREATE TABLE IF NOT EXISTS crm_credentials (
                tenant_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, platform)
            );

            CREATE TABLE IF NOT EXISTS crm_sync_logs (
                run_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created INTEGER NOT NULL DEFAULT 0,
                updated INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                errors TEXT NOT NULL DEFAULT '[]',
                started_at TEXT NOT NULL,
                ended_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_platform ON crm_sync_logs(platform, started_at);
            ",
        )
        .map_err(store_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
        let id: String = row.get("id")?;
        let company: String = row.get("company")?;
        let contact: String = row.get("contact")?;
        let qualification: Option<String> = row.get("qualification")?;
        let additional: String = row.get("additional_data")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(Lead {
            id: id.parse().unwrap_or_default(),
            company: serde_json::from_str(&company).unwrap_or_default(),
            contact: serde_json::from_str(&contact).unwrap_or_default(),
            qualification: qualification.and_then(|q| serde_json::from_str(&q).ok()),
            additional_data: serde_json::from_str(&additional).unwrap_or_default(),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn call_log_from_row(row: &Row<'_>) -> rusqlite::Result<ApiCallLog> {
        let id: String = row.get("id")?;
        let operation: String = row.get("operation")?;
        let created_at: String = row.get("created_at")?;
        Ok(ApiCallLog {
            id: id.parse().unwrap_or_default(),
            provider: row.get("provider")?,
            model: row.get("model")?,
            endpoint: row.get("endpoint")?,
            operation: operation.parse().unwrap_or(TaskClass::Other),
            prompt_tokens: row.get("prompt_tokens")?,
            completion_tokens: row.get("completion_tokens")?,
            total_tokens: row.get("total_tokens")?,
            latency_ms: row.get::<_, i64>("latency_ms")? as u64,
            cost_usd: row.get("cost_usd")?,
            tenant_id: row.get("tenant_id")?,
            success: row.get::<_, i64>("success")? != 0,
            error: row.get("error")?,
            cache_hit: row.get::<_, i64>("cache_hit")? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<AgentExecution> {
        let id: String = row.get("id")?;
        let lead_id: Option<String> = row.get("lead_id")?;
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        Ok(AgentExecution {
            id: id.parse().unwrap_or_default(),
            agent: row.get("agent")?,
            lead_id: lead_id.and_then(|s| s.parse().ok()),
            status: status.parse().unwrap_or(ExecutionStatus::Failed),
            started_at: DateTime::parse_from_rfc3339(&started_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            ended_at: ended_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            latency_ms: row.get::<_, Option<i64>>("latency_ms")?.map(|v| v as u64),
            cost_usd: row.get("cost_usd")?,
            error: row.get("error")?,
        })
    }

    fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<CrmContact> {
        let id: String = row.get("id")?;
        let fields: String = row.get("fields")?;
        let last_synced_at: Option<String> = row.get("last_synced_at")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(CrmContact {
            id: id.parse().unwrap_or_default(),
            platform: row.get("platform")?,
            external_id: row.get("external_id")?,
            email: row.get("email")?,
            name: row.get("name")?,
            title: row.get("title")?,
            phone: row.get("phone")?,
            company: row.get("company")?,
            fields: serde_json::from_str(&fields).unwrap_or_default(),
            enrichment: row.get("enrichment")?,
            last_synced_at: last_synced_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<SyncResult> {
        let run_id: String = row.get("run_id")?;
        let direction: String = row.get("direction")?;
        let status: String = row.get("status")?;
        let errors: String = row.get("errors")?;
        let started_at: String = row.get("started_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        Ok(SyncResult {
            run_id: run_id.parse().unwrap_or_default(),
            platform: row.get("platform")?,
            direction: direction.parse().unwrap_or(SyncDirection::Import),
            status: status.parse().unwrap_or(SyncStatus::Failed),
            processed: row.get::<_, i64>("processed")? as u64,
            created: row.get::<_, i64>("created")? as u64,
            updated: row.get::<_, i64>("updated")? as u64,
            failed: row.get::<_, i64>("failed")? as u64,
            errors: serde_json::from_str(&errors).unwrap_or_default(),
            started_at: DateTime::parse_from_rfc3339(&started_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            ended_at: ended_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

#[async_trait]
impl Repository for SqliteStore {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        if let Some(q) = &lead.qualification
            && q.score > 100
        {
            return Err(FlowError::BadRequest(format!(
                "qualification score {} outside [0,100]",
                q.score
            )));
        }
        if lead.updated_at < lead.created_at {
            return Err(FlowError::BadRequest(
                "lead updated_at precedes created_at".into(),
            ));
        }

        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO leads
             (id, company, contact, qualification, qualification_score, additional_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                lead.id.to_string(),
                serde_json::to_string(&lead.company)?,
                serde_json::to_string(&lead.contact)?,
                lead.qualification
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                lead.qualification.as_ref().map(|q| q.score as i64),
                serde_json::to_string(&lead.additional_data)?,
                lead.created_at.to_rfc3339(),
                lead.updated_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM leads WHERE id = ?1",
            params![id.to_string()],
            Self::lead_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    async fn insert_call_logs(&self, logs: &[ApiCallLog]) -> Result<()> {
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO api_call_logs
                     (id, provider, model, endpoint, operation, prompt_tokens, completion_tokens,
                      total_tokens, latency_ms, cost_usd, tenant_id, success, error, cache_hit, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )
                .map_err(store_err)?;
            for log in logs {
                stmt.execute(params![
                    log.id.to_string(),
                    log.provider,
                    log.model,
                    log.endpoint,
                    log.operation.as_str(),
                    log.prompt_tokens,
                    log.completion_tokens,
                    log.total_tokens,
                    log.latency_ms as i64,
                    log.cost_usd,
                    log.tenant_id,
                    log.success as i64,
                    log.error,
                    log.cache_hit as i64,
                    log.created_at.to_rfc3339(),
                ])
                .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    async fn call_logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<ApiCallLog>> {
        let db = self.db.lock();
        let mut logs = Vec::new();
        match provider {
            Some(p) => {
                let mut stmt = db
                    .prepare_cached(
                        "SELECT * FROM api_call_logs
                         WHERE created_at >= ?1 AND created_at < ?2 AND provider = ?3
                         ORDER BY created_at",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(
                        params![start.to_rfc3339(), end.to_rfc3339(), p],
                        Self::call_log_from_row,
                    )
                    .map_err(store_err)?;
                for row in rows {
                    logs.push(row.map_err(store_err)?);
                }
            }
            None => {
                let mut stmt = db
                    .prepare_cached(
                        "SELECT * FROM api_call_logs
                         WHERE created_at >= ?1 AND created_at < ?2
                         ORDER BY created_at",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(
                        params![start.to_rfc3339(), end.to_rfc3339()],
                        Self::call_log_from_row,
                    )
                    .map_err(store_err)?;
                for row in rows {
                    logs.push(row.map_err(store_err)?);
                }
            }
        }
        Ok(logs)
    }

    async fn usage_buckets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        provider: Option<&str>,
    ) -> Result<Vec<UsageBucket>> {
        let db = self.db.lock();
        let sql = format!(
            "SELECT strftime('{fmt}', created_at) AS bucket,
                    COUNT(*) AS calls,
                    SUM(prompt_tokens) AS prompt_tokens,
                    SUM(completion_tokens) AS completion_tokens,
                    SUM(cost_usd) AS cost_usd,
                    SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END) AS failures
             FROM api_call_logs
             WHERE created_at >= ?1 AND created_at < ?2 {provider_clause}
             GROUP BY bucket ORDER BY bucket",
            fmt = interval.bucket_format(),
            provider_clause = if provider.is_some() {
                "AND provider = ?3"
            } else {
                ""
            },
        );

        let map_row = |row: &Row<'_>| -> rusqlite::Result<UsageBucket> {
            Ok(UsageBucket {
                bucket: row.get("bucket")?,
                calls: row.get::<_, i64>("calls")? as u64,
                prompt_tokens: row.get::<_, Option<i64>>("prompt_tokens")?.unwrap_or(0) as u64,
                completion_tokens: row.get::<_, Option<i64>>("completion_tokens")?.unwrap_or(0)
                    as u64,
                cost_usd: row.get::<_, Option<f64>>("cost_usd")?.unwrap_or(0.0),
                failures: row.get::<_, i64>("failures")? as u64,
            })
        };

        let mut stmt = db.prepare(&sql).map_err(store_err)?;
        let mut buckets = Vec::new();
        match provider {
            Some(p) => {
                let rows = stmt
                    .query_map(params![start.to_rfc3339(), end.to_rfc3339(), p], map_row)
                    .map_err(store_err)?;
                for row in rows {
                    buckets.push(row.map_err(store_err)?);
                }
            }
            None => {
                let rows = stmt
                    .query_map(params![start.to_rfc3339(), end.to_rfc3339()], map_row)
                    .map_err(store_err)?;
                for row in rows {
                    buckets.push(row.map_err(store_err)?);
                }
            }
        }
        Ok(buckets)
    }

    async fn cost_by_provider(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare_cached(
                "SELECT provider, SUM(cost_usd) AS cost FROM api_call_logs
                 WHERE created_at >= ?1 AND created_at < ?2 GROUP BY provider",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                ))
            })
            .map_err(store_err)?;
        let mut map = HashMap::new();
        for row in rows {
            let (provider, cost) = row.map_err(store_err)?;
            map.insert(provider, cost);
        }
        Ok(map)
    }

    async fn insert_execution(&self, exec: &AgentExecution) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO agent_executions
             (id, agent, lead_id, status, started_at, ended_at, latency_ms, cost_usd, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                exec.id.to_string(),
                exec.agent,
                exec.lead_id.map(|id| id.to_string()),
                exec.status.as_str(),
                exec.started_at.to_rfc3339(),
                exec.ended_at.map(|t| t.to_rfc3339()),
                exec.latency_ms.map(|v| v as i64),
                exec.cost_usd,
                exec.error,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_execution(&self, exec: &AgentExecution) -> Result<bool> {
        let db = self.db.lock();
        // A terminal row never changes again: the guard makes the second
        // terminal write a no-op instead of a double transition.
        let changed = db
            .execute(
                "UPDATE agent_executions
                 SET status = ?2, ended_at = ?3, latency_ms = ?4, cost_usd = ?5, error = ?6
                 WHERE id = ?1 AND status NOT IN ('success', 'failed')",
                params![
                    exec.id.to_string(),
                    exec.status.as_str(),
                    exec.ended_at.map(|t| t.to_rfc3339()),
                    exec.latency_ms.map(|v| v as i64),
                    exec.cost_usd,
                    exec.error,
                ],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<AgentExecution>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM agent_executions WHERE id = ?1",
            params![id.to_string()],
            Self::execution_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO checkpoints (execution_id, step, state, suspended, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.execution_id.to_string(),
                checkpoint.step,
                serde_json::to_string(&checkpoint.state)?,
                checkpoint
                    .suspended
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        execution_id: Uuid,
        max_age: Duration,
    ) -> Result<Option<Checkpoint>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(store_err)?;
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM checkpoints
             WHERE execution_id = ?1 AND created_at >= ?2
             ORDER BY step DESC LIMIT 1",
            params![execution_id.to_string(), cutoff.to_rfc3339()],
            |row| {
                let execution_id: String = row.get("execution_id")?;
                let state: String = row.get("state")?;
                let suspended: Option<String> = row.get("suspended")?;
                let created_at: String = row.get("created_at")?;
                Ok(Checkpoint {
                    execution_id: execution_id.parse().unwrap_or_default(),
                    step: row.get("step")?,
                    state: serde_json::from_str(&state).unwrap_or(serde_json::Value::Null),
                    suspended: suspended.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    async fn purge_checkpoints(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(store_err)?;
        let db = self.db.lock();
        let purged = db
            .execute(
                "DELETE FROM checkpoints WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(store_err)?;
        Ok(purged as u64)
    }

    async fn get_contact(&self, platform: &str, external_id: &str) -> Result<Option<CrmContact>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM crm_contacts WHERE platform = ?1 AND external_id = ?2",
            params![platform, external_id],
            Self::contact_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    async fn upsert_contact(&self, contact: &CrmContact) -> Result<bool> {
        let db = self.db.lock();
        let existed: bool = db
            .query_row(
                "SELECT 1 FROM crm_contacts WHERE platform = ?1 AND external_id = ?2",
                params![contact.platform, contact.external_id],
                |_| Ok(true),
            )
            .optional()
            .map_err(store_err)?
            .unwrap_or(false);

        db.execute(
            "INSERT INTO crm_contacts
             (id, platform, external_id, email, name, title, phone, company, fields, enrichment, last_synced_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(platform, external_id) DO UPDATE SET
                 email = excluded.email,
                 name = excluded.name,
                 title = excluded.title,
                 phone = excluded.phone,
                 company = excluded.company,
                 fields = excluded.fields,
                 enrichment = excluded.enrichment,
                 last_synced_at = excluded.last_synced_at,
                 updated_at = excluded.updated_at",
            params![
                contact.id.to_string(),
                contact.platform,
                contact.external_id,
                contact.email,
                contact.name,
                contact.title,
                contact.phone,
                contact.company,
                serde_json::to_string(&contact.fields)?,
                contact.enrichment,
                contact.last_synced_at.map(|t| t.to_rfc3339()),
                contact.updated_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(!existed)
    }

    async fn contacts_updated_since(
        &self,
        platform: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CrmContact>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare_cached(
                "SELECT * FROM crm_contacts WHERE platform = ?1 AND updated_at > ?2
                 ORDER BY updated_at",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![platform, since.to_rfc3339()], Self::contact_from_row)
            .map_err(store_err)?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(store_err)?);
        }
        Ok(contacts)
    }

    async fn put_credential(&self, credential: &CrmCredential) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO crm_credentials (tenant_id, platform, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                credential.tenant_id,
                credential.platform,
                credential.ciphertext,
                credential.updated_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_credential(
        &self,
        tenant: &str,
        platform: &str,
    ) -> Result<Option<CrmCredential>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM crm_credentials WHERE tenant_id = ?1 AND platform = ?2",
            params![tenant, platform],
            |row| {
                let updated_at: String = row.get("updated_at")?;
                Ok(CrmCredential {
                    tenant_id: row.get("tenant_id")?,
                    platform: row.get("platform")?,
                    ciphertext: row.get("ciphertext")?,
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    async fn insert_sync_log(&self, result: &SyncResult) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO crm_sync_logs
             (run_id, platform, direction, status, processed, created, updated, failed, errors, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                result.run_id.to_string(),
                result.platform,
                result.direction.as_str(),
                result.status.as_str(),
                result.processed as i64,
                result.created as i64,
                result.updated as i64,
                result.failed as i64,
                serde_json::to_string(&result.errors)?,
                result.started_at.to_rfc3339(),
                result.ended_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_sync_log(&self, result: &SyncResult) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE crm_sync_logs
             SET status = ?2, processed = ?3, created = ?4, updated = ?5, failed = ?6,
                 errors = ?7, ended_at = ?8
             WHERE run_id = ?1",
            params![
                result.run_id.to_string(),
                result.status.as_str(),
                result.processed as i64,
                result.created as i64,
                result.updated as i64,
                result.failed as i64,
                serde_json::to_string(&result.errors)?,
                result.ended_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn sync_history(&self, platform: Option<&str>, limit: usize) -> Result<Vec<SyncResult>> {
        let db = self.db.lock();
        let mut results = Vec::new();
        match platform {
            Some(p) => {
                let mut stmt = db
                    .prepare_cached(
                        "SELECT * FROM crm_sync_logs WHERE platform = ?1
                         ORDER BY started_at DESC LIMIT ?2",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(params![p, limit as i64], Self::sync_log_from_row)
                    .map_err(store_err)?;
                for row in rows {
                    results.push(row.map_err(store_err)?);
                }
            }
            None => {
                let mut stmt = db
                    .prepare_cached(
                        "SELECT * FROM crm_sync_logs ORDER BY started_at DESC LIMIT ?1",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(params![limit as i64], Self::sync_log_from_row)
                    .map_err(store_err)?;
                for row in rows {
                    results.push(row.map_err(store_err)?);
                }
            }
        }
        Ok(results)
    }

    async fn latest_sync(
        &self,
        platform: &str,
        direction: SyncDirection,
    ) -> Result<Option<SyncResult>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT * FROM crm_sync_logs WHERE platform = ?1 AND direction = ?2
             ORDER BY started_at DESC LIMIT 1",
            params![platform, direction.as_str()],
            Self::sync_log_from_row,
        )
        .optional()
        .map_err(store_err)
    }
}
