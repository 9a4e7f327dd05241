use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use meteo_core::{FetchOutcome, SourceKind, SyncStatus};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub forecast_interval: Duration,
    pub alert_interval: Duration,
    pub alert_retention: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            forecast_interval: Duration::from_secs(60 * 60),
            alert_interval: Duration::from_secs(10 * 60),
            alert_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerInfo {
    pub is_running: bool,
    pub forecast_interval_minutes: u64,
    pub alert_interval_minutes: u64,
    pub next_forecast_run: Option<DateTime<Utc>>,
    pub next_alert_run: Option<DateTime<Utc>>,
    pub sync_status: Option<SyncStatus>,
}

struct RunningJobs {
    sched: JobScheduler,
    forecast_job: Uuid,
    alert_job: Uuid,
}

/// Two repeating jobs, one per source, on a shared job scheduler.
///
/// A tick that finds its source busy is dropped rather than queued.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    config: ScheduleConfig,
    jobs: Mutex<Option<RunningJobs>>,
    running: AtomicBool,
    sync_status: RwLock<Option<SyncStatus>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ScheduleConfig) -> Self {
        Self {
            orchestrator,
            config,
            jobs: Mutex::new(None),
            running: AtomicBool::new(false),
            sync_status: RwLock::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register both jobs and start ticking. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            warn!("scheduler already running");
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let forecast_job = sched
            .add(self.repeating_job(SourceKind::Forecast)?)
            .await
            .context("adding forecast job")?;
        let alert_job = sched
            .add(self.repeating_job(SourceKind::Alert)?)
            .await
            .context("adding alert job")?;
        sched.start().await.context("starting scheduler")?;

        *jobs = Some(RunningJobs {
            sched,
            forecast_job,
            alert_job,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(
            forecast_every_min = self.config.forecast_interval.as_secs() / 60,
            alert_every_min = self.config.alert_interval.as_secs() / 60,
            "scheduler started"
        );
        Ok(())
    }

    fn repeating_job(self: &Arc<Self>, kind: SourceKind) -> Result<Job> {
        let interval = match kind {
            SourceKind::Forecast => self.config.forecast_interval,
            SourceKind::Alert => self.config.alert_interval,
        };
        let this = Arc::clone(self);
        Job::new_repeated_async(interval, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.tick(kind).await;
            })
        })
        .with_context(|| format!("creating {} job", kind.as_str()))
    }

    /// One scheduled run of `kind`. Also retires expired alerts on alert ticks.
    pub async fn tick(&self, kind: SourceKind) -> Option<FetchOutcome> {
        let Some(outcome) = self.orchestrator.try_ingest(kind).await else {
            debug!(source = kind.as_str(), "previous run still in flight, skipping tick");
            return None;
        };
        if kind == SourceKind::Alert {
            self.orchestrator
                .expire_alerts(self.config.alert_retention)
                .await;
        }
        self.refresh_sync_status().await;
        Some(outcome)
    }

    /// Shut the job scheduler down and wait for in-flight runs to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut jobs) = self.jobs.lock().await.take() else {
            return Ok(());
        };
        jobs.sched
            .shutdown()
            .await
            .context("shutting down scheduler")?;
        self.orchestrator.wait_idle(SourceKind::Forecast).await;
        self.orchestrator.wait_idle(SourceKind::Alert).await;
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
        Ok(())
    }

    /// Fetch forecasts then alerts right now, outside the schedule.
    pub async fn trigger_immediate_fetch(&self) -> Vec<FetchOutcome> {
        info!("starting full data sync");
        let forecast = self.orchestrator.ingest(SourceKind::Forecast).await;
        let alert = self.orchestrator.ingest(SourceKind::Alert).await;
        self.refresh_sync_status().await;
        info!(
            forecasts = if forecast.success { "OK" } else { "FAIL" },
            alerts = if alert.success { "OK" } else { "FAIL" },
            "sync complete"
        );
        vec![forecast, alert]
    }

    async fn refresh_sync_status(&self) {
        let status = self.orchestrator.compute_sync_status().await;
        *self.sync_status.write().await = Some(status);
    }

    pub async fn last_results(&self) -> Vec<FetchOutcome> {
        self.orchestrator.last_results().await
    }

    pub async fn sync_status(&self) -> Option<SyncStatus> {
        self.sync_status.read().await.clone()
    }

    pub async fn available_cities(&self) -> Vec<String> {
        self.orchestrator.available_cities().await
    }

    pub async fn scheduler_info(&self) -> SchedulerInfo {
        let (next_forecast_run, next_alert_run) = match self.jobs.lock().await.as_ref() {
            Some(jobs) => {
                let mut sched = jobs.sched.clone();
                (
                    sched.next_tick_for_job(jobs.forecast_job).await.ok().flatten(),
                    sched.next_tick_for_job(jobs.alert_job).await.ok().flatten(),
                )
            }
            None => (None, None),
        };
        SchedulerInfo {
            is_running: self.is_running(),
            forecast_interval_minutes: self.config.forecast_interval.as_secs() / 60,
            alert_interval_minutes: self.config.alert_interval.as_secs() / 60,
            next_forecast_run,
            next_alert_run,
            sync_status: self.sync_status().await,
        }
    }
}
