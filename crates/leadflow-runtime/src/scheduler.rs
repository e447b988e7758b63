//! # Periodic & On-Demand Job Scheduler
//!
//! Owns the recurring maintenance of the platform (CRM syncs on their
//! cadences, cache and checkpoint hygiene) plus on-demand job dispatch
//! onto a bounded worker pool. Jobs are at-most-once-in-flight per job
//! identity: a job whose previous run is still executing is skipped and
//! logged. Pool overflow beyond the queue cap is rejected with
//! `backpressure`.

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadflow_bus::Bus;
use leadflow_config::SchedulerConfig;
use leadflow_core::{FlowError, Result, SyncDirection};
use leadflow_crm::{SyncEngine, SyncFilters};

use crate::context::CheckpointStore;

/// What a job does when it fires.
#[derive(Debug, Clone)]
pub enum JobKind {
    CrmSync {
        platform: String,
        direction: SyncDirection,
    },
    /// Hourly hygiene: drop expired bus entries and aged checkpoints.
    Purge,
}

/// A recurring job. The cron expression uses the six-field form with
/// seconds, e.g. `"0 0 */2 * * *"` for every two hours.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub label: String,
    pub cron: String,
    pub kind: JobKind,
}

/// Terminal state of one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed(String),
}

/// Handle onto one dispatched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    pub label: String,
    rx: watch::Receiver<Option<JobStatus>>,
}

impl JobHandle {
    pub async fn wait(mut self) -> JobStatus {
        loop {
            let current = self.rx.borrow().clone();
            if let Some(status) = current {
                return status;
            }
            if self.rx.changed().await.is_err() {
                return JobStatus::Failed("job vanished".into());
            }
        }
    }
}

pub struct Scheduler {
    sync_engine: Arc<SyncEngine>,
    bus: Arc<dyn Bus>,
    checkpoints: Arc<CheckpointStore>,
    jobs: Vec<JobSpec>,
    in_flight: DashMap<String, JobHandle>,
    pool: Arc<Semaphore>,
    /// Dispatched jobs not yet finished: running + queued.
    outstanding: Arc<AtomicUsize>,
    workers: usize,
    queue_cap: usize,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        sync_engine: Arc<SyncEngine>,
        bus: Arc<dyn Bus>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            sync_engine,
            bus,
            checkpoints,
            jobs: Vec::new(),
            in_flight: DashMap::new(),
            pool: Arc::new(Semaphore::new(config.workers)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            workers: config.workers,
            queue_cap: config.queue_cap,
        }
    }

    /// The standing schedule: writable platforms sync bidirectionally
    /// every two hours, the read-only sources import daily off-peak, and
    /// aged caches are purged hourly.
    pub fn with_standard_jobs(mut self) -> Self {
        for platform in self.sync_engine.writable_platforms() {
            self.jobs.push(JobSpec {
                label: format!("sync:{platform}:bidirectional"),
                cron: "0 0 */2 * * *".into(),
                kind: JobKind::CrmSync {
                    platform,
                    direction: SyncDirection::Bidirectional,
                },
            });
        }
        for (platform, cron) in [("apollo", "0 0 2 * * *"), ("salesnav", "0 0 3 * * *")] {
            if self.sync_engine.platform(platform).is_some() {
                self.jobs.push(JobSpec {
                    label: format!("sync:{platform}:import"),
                    cron: cron.into(),
                    kind: JobKind::CrmSync {
                        platform: platform.into(),
                        direction: SyncDirection::Import,
                    },
                });
            }
        }
        self.jobs.push(JobSpec {
            label: "maintenance:purge".into(),
            cron: "0 0 * * * *".into(),
            kind: JobKind::Purge,
        });
        self
    }

    pub fn add_job(&mut self, job: JobSpec) -> Result<()> {
        Schedule::from_str(&job.cron)
            .map_err(|e| FlowError::Config(format!("invalid cron expression: {e}")))?;
        self.jobs.push(job);
        Ok(())
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    /// Dispatch a job now. A job with the same label already in flight is
    /// coalesced onto the running one; a saturated pool and full queue
    /// reject with `backpressure`.
    pub fn dispatch(self: &Arc<Self>, label: &str, kind: JobKind) -> Result<JobHandle> {
        if let Some(handle) = self.in_flight.get(label) {
            debug!(label, "job already in flight, returning its handle");
            return Ok(handle.clone());
        }

        if self.outstanding.load(Ordering::Acquire) >= self.workers + self.queue_cap {
            warn!(label, "worker pool saturated, rejecting dispatch");
            return Err(FlowError::Backpressure);
        }

        let (tx, rx) = watch::channel(None);
        let handle = JobHandle {
            id: Uuid::new_v4(),
            label: label.to_string(),
            rx,
        };
        self.in_flight.insert(label.to_string(), handle.clone());
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        let scheduler = Arc::clone(self);
        let label = label.to_string();
        tokio::spawn(async move {
            let Ok(permit) = scheduler.pool.acquire().await else {
                // Pool only closes on shutdown.
                scheduler.in_flight.remove(&label);
                scheduler.outstanding.fetch_sub(1, Ordering::AcqRel);
                return;
            };
            let status = match scheduler.run_job(&kind).await {
                Ok(()) => JobStatus::Success,
                Err(e) => {
                    warn!(label = %label, error = %e, "job failed");
                    JobStatus::Failed(e.code().into())
                }
            };
            drop(permit);
            scheduler.in_flight.remove(&label);
            scheduler.outstanding.fetch_sub(1, Ordering::AcqRel);
            let _ = tx.send(Some(status));
        });
        Ok(handle)
    }

    async fn run_job(&self, kind: &JobKind) -> Result<()> {
        match kind {
            JobKind::CrmSync {
                platform,
                direction,
            } => {
                let handle =
                    self.sync_engine
                        .sync(platform, *direction, SyncFilters::default())?;
                handle.wait().await?;
                Ok(())
            }
            JobKind::Purge => {
                let purged_kv = self.bus.purge_expired().await?;
                let purged_checkpoints = self.checkpoints.purge().await?;
                debug!(purged_kv, purged_checkpoints, "maintenance purge done");
                Ok(())
            }
        }
    }

    /// Scheduler loop; spawn as a background task. Fires due jobs every
    /// ten seconds.
    pub async fn run(self: Arc<Self>) {
        let check_interval = tokio::time::Duration::from_secs(10);
        info!(jobs = self.jobs.len(), "scheduler started");
        let mut last_fired: std::collections::HashMap<String, DateTime<Utc>> =
            std::collections::HashMap::new();
        let started = Utc::now();

        loop {
            tokio::time::sleep(check_interval).await;
            let now = Utc::now();

            for job in &self.jobs {
                let schedule = match Schedule::from_str(&job.cron) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        error!(label = %job.label, error = %e, "invalid cron expression");
                        continue;
                    }
                };
                let since = last_fired.get(&job.label).copied().unwrap_or(started);
                let due = schedule
                    .after(&since)
                    .take(1)
                    .next()
                    .is_some_and(|next| next <= now);
                if !due {
                    continue;
                }
                last_fired.insert(job.label.clone(), now);

                if self.in_flight.contains_key(&job.label) {
                    // At-most-once-in-flight per job identity.
                    info!(label = %job.label, "previous run still executing, skipping");
                    continue;
                }
                match self.dispatch(&job.label, job.kind.clone()) {
                    Ok(_) => debug!(label = %job.label, "scheduled job dispatched"),
                    Err(e) => warn!(label = %job.label, error = %e, "scheduled dispatch failed"),
                }
            }
        }
    }
}
