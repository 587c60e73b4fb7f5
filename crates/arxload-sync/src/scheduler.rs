use std::sync::Arc;

use anyhow::{Context, Result};
use arxload_core::{SyncMode, SyncState};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{SyncOrchestrator, SyncRunSummary};

/// At most one run at a time. A trigger that finds the gate taken is dropped,
/// not queued.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    gate: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.gate).try_lock_owned().ok()
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

/// The orchestrator behind a single-flight gate, shared by every trigger
/// (cron, HTTP, CLI).
pub struct SyncJob {
    orchestrator: SyncOrchestrator,
    flight: SingleFlight,
    last: RwLock<Option<SyncRunSummary>>,
}

impl SyncJob {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            flight: SingleFlight::new(),
            last: RwLock::new(None),
        }
    }

    pub fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Mode used when a trigger does not name one.
    pub fn default_mode(&self) -> SyncMode {
        self.orchestrator.config().mode
    }

    pub fn current_state(&self) -> SyncState {
        self.orchestrator.state()
    }

    pub async fn last_summary(&self) -> Option<SyncRunSummary> {
        self.last.read().await.clone()
    }

    /// Run to completion unless another run is active (`None`).
    pub async fn run_if_idle(&self, mode: SyncMode) -> Option<SyncRunSummary> {
        let Some(permit) = self.flight.try_begin() else {
            warn!(%mode, "sync already running; trigger dropped");
            return None;
        };
        Some(self.execute(mode, permit).await)
    }

    /// Start a run in the background. `false` when one is already active.
    pub fn spawn_if_idle(self: &Arc<Self>, mode: SyncMode) -> bool {
        let Some(permit) = self.flight.try_begin() else {
            warn!(%mode, "sync already running; trigger dropped");
            return false;
        };
        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.execute(mode, permit).await;
        });
        true
    }

    async fn execute(&self, mode: SyncMode, permit: OwnedMutexGuard<()>) -> SyncRunSummary {
        let summary = self.orchestrator.run(mode).await;
        *self.last.write().await = Some(summary.clone());
        drop(permit);
        summary
    }
}

/// Cron trigger for the sync job.
pub struct ScheduleAdapter {
    job: Arc<SyncJob>,
    cron: String,
    mode: SyncMode,
}

impl ScheduleAdapter {
    pub fn new(job: Arc<SyncJob>, cron: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            job,
            cron: cron.into(),
            mode,
        }
    }

    /// Register the cron job and start the scheduler. Keep the returned
    /// scheduler alive for as long as runs should fire.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = Arc::clone(&self.job);
        let mode = self.mode;
        let cron_job = Job::new_async(&self.cron, move |_uuid, _l| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                info!(%mode, "scheduled sync triggered");
                if let Some(summary) = job.run_if_idle(mode).await {
                    info!(run_id = %summary.run_id, state = %summary.state, "scheduled sync finished");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.cron))?;
        sched.add(cron_job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, %mode, "sync scheduler started");
        Ok(sched)
    }
}
