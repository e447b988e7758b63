use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use leadflow_core::{
    CrmContact, FlowError, Result, SyncDirection, SyncError, SyncResult, SyncStatus,
};
use leadflow_llm::breaker::{Admission, BreakerRegistry};
use leadflow_llm::retry::{RetryPolicy, is_retryable, retry_after_hint};
use leadflow_store::Repository;

use crate::dlq::DeadLetterQueue;
use crate::platform::{CrmPlatform, ExternalRecord, SyncFilters};
use crate::ratelimit::RateLimiter;

/// Handle onto a sync run. Coalesced dispatches share the same handle.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    pub run_id: Uuid,
    rx: watch::Receiver<Option<SyncResult>>,
}

impl SyncHandle {
    /// Wait for the run to finish.
    pub async fn wait(mut self) -> Result<SyncResult> {
        loop {
            let current = self.rx.borrow().clone();
            if let Some(result) = current {
                return Ok(result);
            }
            if self.rx.changed().await.is_err() {
                return Err(FlowError::Store("sync run vanished".into()));
            }
        }
    }
}

/// One row of `sync_health()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlatformHealth {
    pub platform: String,
    pub writable: bool,
    pub breaker_open: bool,
    pub budget_remaining: u64,
    pub last_status: Option<SyncStatus>,
}

/// Aggregated counters over a window of sync runs.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncMetrics {
    pub runs: u64,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub rate_limited_runs: u64,
}

/// Bidirectional reconcile engine over the registered platforms.
///
/// At most one run per `(platform, direction)` is in flight; additional
/// dispatches coalesce onto the running one. Individual unit failures
/// never abort a run: they retry, then dead-letter.
pub struct SyncEngine {
    platforms: HashMap<String, Arc<dyn CrmPlatform>>,
    repo: Arc<dyn Repository>,
    limiter: RateLimiter,
    dlq: DeadLetterQueue,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    in_flight: DashMap<(String, SyncDirection), SyncHandle>,
}

impl SyncEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        limiter: RateLimiter,
        dlq: DeadLetterQueue,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            platforms: HashMap::new(),
            repo,
            limiter,
            dlq,
            breakers,
            retry,
            in_flight: DashMap::new(),
        }
    }

    pub fn add_platform(&mut self, platform: Arc<dyn CrmPlatform>) {
        info!(platform = platform.name(), "registered crm platform");
        self.platforms.insert(platform.name().to_string(), platform);
    }

    pub fn platform_names(&self) -> Vec<String> {
        self.platforms.keys().cloned().collect()
    }

    pub fn platform(&self, name: &str) -> Option<Arc<dyn CrmPlatform>> {
        self.platforms.get(name).cloned()
    }

    /// Platforms that accept writes (targets of the periodic
    /// bidirectional sync).
    pub fn writable_platforms(&self) -> Vec<String> {
        self.platforms
            .values()
            .filter(|p| p.writable())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Start (or join) a sync run.
    pub fn sync(
        self: &Arc<Self>,
        platform: &str,
        direction: SyncDirection,
        filters: SyncFilters,
    ) -> Result<SyncHandle> {
        let adapter = self
            .platforms
            .get(platform)
            .cloned()
            .ok_or_else(|| FlowError::Platform {
                platform: platform.to_string(),
                reason: "unknown platform".into(),
            })?;
        if direction.includes_export() && !adapter.writable() {
            return Err(FlowError::BadRequest(format!(
                "platform {platform} is read-only, direction {} is not allowed",
                direction.as_str()
            )));
        }

        let key = (platform.to_string(), direction);
        match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                info!(platform, direction = direction.as_str(), "coalesced onto in-flight run");
                Ok(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let run = SyncResult::begin(platform, direction);
                let (tx, rx) = watch::channel(None);
                let handle = SyncHandle {
                    run_id: run.run_id,
                    rx,
                };
                entry.insert(handle.clone());

                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    let result = engine.run(adapter, direction, filters, run).await;
                    engine.in_flight.remove(&key);
                    let _ = tx.send(Some(result));
                });
                Ok(handle)
            }
        }
    }

    /// In-flight runs, optionally narrowed to one platform.
    pub fn sync_status(&self, platform: Option<&str>) -> Vec<(String, SyncDirection, Uuid)> {
        self.in_flight
            .iter()
            .filter(|entry| platform.is_none_or(|p| entry.key().0 == p))
            .map(|entry| (entry.key().0.clone(), entry.key().1, entry.value().run_id))
            .collect()
    }

    pub async fn sync_history(
        &self,
        platform: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncResult>> {
        self.repo.sync_history(platform, limit).await
    }

    pub async fn sync_metrics(
        &self,
        platform: Option<&str>,
        window: chrono::Duration,
    ) -> Result<SyncMetrics> {
        let cutoff = Utc::now() - window;
        let history = self.repo.sync_history(platform, 1_000).await?;
        let mut metrics = SyncMetrics::default();
        for run in history.iter().filter(|r| r.started_at >= cutoff) {
            metrics.runs += 1;
            metrics.processed += run.processed;
            metrics.created += run.created;
            metrics.updated += run.updated;
            metrics.failed += run.failed;
            if run.status == SyncStatus::RateLimited {
                metrics.rate_limited_runs += 1;
            }
        }
        Ok(metrics)
    }

    pub async fn sync_health(&self) -> Result<Vec<PlatformHealth>> {
        let mut health = Vec::new();
        for (name, platform) in &self.platforms {
            let last = self
                .repo
                .sync_history(Some(name), 1)
                .await?
                .into_iter()
                .next();
            health.push(PlatformHealth {
                platform: name.clone(),
                writable: platform.writable(),
                breaker_open: self.breakers.is_open(name),
                budget_remaining: self.limiter.remaining(name, platform.rate_budget()).await?,
                last_status: last.map(|r| r.status),
            });
        }
        health.sort_by(|a, b| a.platform.cmp(&b.platform));
        Ok(health)
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    // ── Run internals ──────────────────────────────────────────

    async fn run(
        &self,
        adapter: Arc<dyn CrmPlatform>,
        direction: SyncDirection,
        filters: SyncFilters,
        mut run: SyncResult,
    ) -> SyncResult {
        if let Err(e) = self.repo.insert_sync_log(&run).await {
            warn!(error = %e, "failed to open sync log");
        }

        match direction {
            SyncDirection::Import | SyncDirection::Bidirectional => {
                self.reconcile_pages(&adapter, direction, &filters, &mut run)
                    .await;
            }
            SyncDirection::Export => {
                self.export_changes(&adapter, &mut run).await;
            }
        }

        if run.status == SyncStatus::Running {
            run.status = if run.processed == 0 && run.failed > 0 {
                SyncStatus::Failed
            } else {
                SyncStatus::Completed
            };
        }
        run.ended_at = Some(Utc::now());
        if let Err(e) = self.repo.update_sync_log(&run).await {
            warn!(error = %e, "failed to close sync log");
        }
        info!(
            platform = %run.platform,
            direction = direction.as_str(),
            status = run.status.as_str(),
            processed = run.processed,
            created = run.created,
            updated = run.updated,
            failed = run.failed,
            "sync run finished"
        );
        run
    }

    async fn reconcile_pages(
        &self,
        adapter: &Arc<dyn CrmPlatform>,
        direction: SyncDirection,
        filters: &SyncFilters,
        run: &mut SyncResult,
    ) {
        let platform = adapter.name().to_string();
        let budget = adapter.rate_budget();
        let mut cursor: Option<String> = None;

        loop {
            if !self
                .limiter
                .try_consume(&platform, budget, 1)
                .await
                .unwrap_or(false)
            {
                // Budget exhausted: the page that could not be fetched is
                // parked for the operator, and no further calls go out
                // until the platform's reset boundary.
                run.status = SyncStatus::RateLimited;
                run.failed += 1;
                run.errors.push(SyncError::PageFailed {
                    cursor: cursor.clone(),
                    error: "rate_limit".into(),
                });
                let _ = self
                    .dlq
                    .push(&platform, json!({ "cursor": cursor }), "rate_limit")
                    .await;
                return;
            }

            let page = match self
                .call_platform(&platform, || adapter.list(filters, cursor.clone()))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    run.failed += 1;
                    run.errors.push(SyncError::PageFailed {
                        cursor: cursor.clone(),
                        error: e.code().into(),
                    });
                    let _ = self
                        .dlq
                        .push(&platform, json!({ "cursor": cursor }), e.code())
                        .await;
                    if matches!(e, FlowError::RateLimited { .. }) {
                        run.status = SyncStatus::RateLimited;
                    }
                    return;
                }
            };

            for record in page.records {
                run.processed += 1;
                let external_id = record.external_id.clone();
                if let Err(e) = self
                    .reconcile_one(adapter, direction, record.clone(), run)
                    .await
                {
                    run.failed += 1;
                    run.errors.push(SyncError::UnitFailed {
                        external_id,
                        error: e.code().into(),
                    });
                    let _ = self
                        .dlq
                        .push(&platform, serde_json::to_value(&record).unwrap_or_default(), e.code())
                        .await;
                    if matches!(e, FlowError::RateLimited { .. }) {
                        run.status = SyncStatus::RateLimited;
                        return;
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return,
            }
        }
    }

    async fn reconcile_one(
        &self,
        adapter: &Arc<dyn CrmPlatform>,
        direction: SyncDirection,
        external: ExternalRecord,
        run: &mut SyncResult,
    ) -> Result<()> {
        let platform = adapter.name();
        let local = self.repo.get_contact(platform, &external.external_id).await?;

        let Some(local) = local else {
            let contact = contact_from_external(platform, &external);
            self.repo.upsert_contact(&contact).await?;
            run.created += 1;
            return Ok(());
        };

        let last_sync = local
            .last_synced_at
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let external_changed = external.updated_at > last_sync;
        let local_changed = local.updated_at > last_sync;
        if !external_changed && !local_changed {
            return Ok(()); // neither side moved since the last sync
        }

        // Winner by updated_at; ties prefer external.
        let external_wins = external.updated_at >= local.updated_at;

        // Critical fields are never silently resolved: a human gets a
        // review entry even though the merge proceeds.
        for (field, old, new) in [
            ("email", &local.email, &external.email),
            ("name", &local.name, &external.name),
        ] {
            if let (Some(old), Some(new)) = (old, new)
                && old != new
            {
                run.errors.push(SyncError::ConflictManualReview {
                    external_id: external.external_id.clone(),
                    field: field.into(),
                    old: old.clone(),
                    new: new.clone(),
                });
            }
        }

        let merged = merge_contact(local, &external, external_wins);
        self.repo.upsert_contact(&merged).await?;
        run.updated += 1;

        if direction.includes_export() && !external_wins && adapter.writable() {
            let budget = adapter.rate_budget();
            if !self.limiter.try_consume(platform, budget, 1).await? {
                return Err(FlowError::RateLimited {
                    retry_after_secs: None,
                });
            }
            let outbound = external_from_contact(&merged);
            self.call_platform(platform, || adapter.upsert(&outbound))
                .await?;
        }
        Ok(())
    }

    async fn export_changes(&self, adapter: &Arc<dyn CrmPlatform>, run: &mut SyncResult) {
        let platform = adapter.name().to_string();
        let budget = adapter.rate_budget();
        let since = self
            .repo
            .latest_sync(&platform, SyncDirection::Export)
            .await
            .ok()
            .flatten()
            .and_then(|r| r.ended_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let locals = match self.repo.contacts_updated_since(&platform, since).await {
            Ok(locals) => locals,
            Err(e) => {
                run.failed += 1;
                run.errors.push(SyncError::PageFailed {
                    cursor: None,
                    error: e.code().into(),
                });
                return;
            }
        };

        for mut contact in locals {
            run.processed += 1;
            if !self
                .limiter
                .try_consume(&platform, budget, 1)
                .await
                .unwrap_or(false)
            {
                run.status = SyncStatus::RateLimited;
                run.failed += 1;
                run.errors.push(SyncError::UnitFailed {
                    external_id: contact.external_id.clone(),
                    error: "rate_limit".into(),
                });
                let _ = self
                    .dlq
                    .push(
                        &platform,
                        serde_json::to_value(&contact).unwrap_or_default(),
                        "rate_limit",
                    )
                    .await;
                return;
            }

            let outbound = external_from_contact(&contact);
            match self
                .call_platform(&platform, || adapter.upsert(&outbound))
                .await
            {
                Ok(()) => {
                    run.updated += 1;
                    contact.last_synced_at = Some(Utc::now());
                    let _ = self.repo.upsert_contact(&contact).await;
                }
                Err(e) => {
                    run.failed += 1;
                    run.errors.push(SyncError::UnitFailed {
                        external_id: contact.external_id.clone(),
                        error: e.code().into(),
                    });
                    let _ = self
                        .dlq
                        .push(
                            &platform,
                            serde_json::to_value(&contact).unwrap_or_default(),
                            e.code(),
                        )
                        .await;
                }
            }
        }
    }

    /// Breaker + bounded retry around one platform call. Mirrors the
    /// provider stack's resilience discipline.
    async fn call_platform<T, F, Fut>(&self, platform: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.breakers.try_acquire(platform) {
            Admission::Rejected => {
                return Err(FlowError::CircuitOpen {
                    provider: platform.to_string(),
                });
            }
            Admission::Allowed | Admission::Probe => {}
        }

        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    self.breakers.record_success(platform);
                    return Ok(value);
                }
                Err(e) if is_retryable(&e) && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, retry_after_hint(&e));
                    warn!(platform, attempt = attempt + 1, error = %e, "retrying platform call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.breakers.record_failure(
                        platform,
                        matches!(
                            e,
                            FlowError::Upstream(_) | FlowError::Timeout(_) | FlowError::Protocol(_)
                        ),
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn contact_from_external(platform: &str, external: &ExternalRecord) -> CrmContact {
    CrmContact {
        id: Uuid::new_v4(),
        platform: platform.to_string(),
        external_id: external.external_id.clone(),
        email: external.email.clone(),
        name: external.name.clone(),
        title: external.title.clone(),
        phone: external.phone.clone(),
        company: external.company.clone(),
        fields: external.fields.clone(),
        enrichment: None,
        last_synced_at: Some(Utc::now()),
        updated_at: external.updated_at,
    }
}

fn external_from_contact(contact: &CrmContact) -> ExternalRecord {
    ExternalRecord {
        external_id: contact.external_id.clone(),
        email: contact.email.clone(),
        name: contact.name.clone(),
        title: contact.title.clone(),
        phone: contact.phone.clone(),
        company: contact.company.clone(),
        fields: contact.fields.clone(),
        updated_at: contact.updated_at,
    }
}

/// Merge the loser into the winner: non-null winner fields overwrite,
/// loser fields fill the gaps, extra fields union with winner priority.
/// Local enrichment survives either way (the external side carries none).
fn merge_contact(mut local: CrmContact, external: &ExternalRecord, external_wins: bool) -> CrmContact {
    fn pick(winner: &Option<String>, loser: &Option<String>) -> Option<String> {
        winner.clone().or_else(|| loser.clone())
    }

    if external_wins {
        local.email = pick(&external.email, &local.email);
        local.name = pick(&external.name, &local.name);
        local.title = pick(&external.title, &local.title);
        local.phone = pick(&external.phone, &local.phone);
        local.company = pick(&external.company, &local.company);
        for (key, value) in &external.fields {
            local.fields.insert(key.clone(), value.clone());
        }
        local.updated_at = external.updated_at;
    } else {
        local.email = pick(&local.email, &external.email);
        local.name = pick(&local.name, &external.name);
        local.title = pick(&local.title, &external.title);
        local.phone = pick(&local.phone, &external.phone);
        local.company = pick(&local.company, &external.company);
        for (key, value) in &external.fields {
            local.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    local.last_synced_at = Some(Utc::now());
    local
}
