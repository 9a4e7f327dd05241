//! Ingestion orchestration and the dual-interval polling schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use meteo_adapters::ValidationError;
use meteo_core::{FetchOutcome, SourceDescriptor};
use meteo_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, SqliteStore, WeatherStore,
    DEFAULT_USER_AGENT,
};
use thiserror::Error;
use tracing::info;

mod orchestrator;
mod scheduler;

pub use orchestrator::Orchestrator;
pub use scheduler::{ScheduleConfig, Scheduler, SchedulerInfo};

pub const CRATE_NAME: &str = "meteo-sync";

pub const DEFAULT_FORECAST_URL: &str = "http://www.meteoromania.ro/anm/prognoza-orase-xml.php";
pub const DEFAULT_ALERTS_URL: &str = "http://www.meteoromania.ro/anm2/avertizari-rss.php";

const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;
const MAX_HTTP_TIMEOUT_SECS: u64 = 600;
const MAX_HTTP_RETRIES: u64 = 10;
const MAX_HTTP_BACKOFF_MS: u64 = 60_000;

/// Why a source run produced no records.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub forecast_url: String,
    pub alerts_url: String,
    pub forecast_interval_minutes: u64,
    pub alert_interval_minutes: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub http_backoff_ms: u64,
    pub alert_retention_hours: u64,
    pub scheduler_enabled: bool,
    pub initial_fetch: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to
    /// defaults and numbers are clamped to workable ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };

        Self {
            database_url: text("DATABASE_URL", "sqlite://weather.db"),
            forecast_url: text("METEO_FORECAST_URL", DEFAULT_FORECAST_URL),
            alerts_url: text("METEO_ALERTS_URL", DEFAULT_ALERTS_URL),
            forecast_interval_minutes: number("METEO_FORECAST_INTERVAL_MINUTES", 60)
                .clamp(1, MAX_INTERVAL_MINUTES),
            alert_interval_minutes: number("METEO_ALERT_INTERVAL_MINUTES", 10)
                .clamp(1, MAX_INTERVAL_MINUTES),
            user_agent: text("METEO_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: number("METEO_HTTP_TIMEOUT_SECS", 15).clamp(1, MAX_HTTP_TIMEOUT_SECS),
            http_max_retries: number("METEO_HTTP_MAX_RETRIES", 3).min(MAX_HTTP_RETRIES) as usize,
            http_backoff_ms: number("METEO_HTTP_BACKOFF_MS", 500).min(MAX_HTTP_BACKOFF_MS),
            alert_retention_hours: number("METEO_ALERT_RETENTION_HOURS", 24).min(MAX_RETENTION_HOURS),
            scheduler_enabled: flag("METEO_SCHEDULER_ENABLED", true),
            initial_fetch: flag("METEO_INITIAL_FETCH", true),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = BackoffPolicy::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                base_delay: Duration::from_millis(self.http_backoff_ms),
                max_delay: defaults.max_delay,
            },
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            forecast_interval: Duration::from_secs(self.forecast_interval_minutes.saturating_mul(60)),
            alert_interval: Duration::from_secs(self.alert_interval_minutes.saturating_mul(60)),
            alert_retention: Duration::from_secs(self.alert_retention_hours.saturating_mul(60 * 60)),
        }
    }

    pub fn forecast_source(&self) -> SourceDescriptor {
        SourceDescriptor::forecast(self.forecast_url.clone())
    }

    pub fn alert_source(&self) -> SourceDescriptor {
        SourceDescriptor::alerts(self.alerts_url.clone())
    }
}

/// Everything a front end needs, built once at startup and shared by handle.
#[derive(Clone)]
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<dyn WeatherStore>,
    pub scheduler: Arc<Scheduler>,
    pub started_at: DateTime<Utc>,
}

impl SyncContext {
    /// Open the configured database and wire the pipeline on top of it.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening weather store at {}", config.database_url))?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn WeatherStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            http,
            config.forecast_source(),
            config.alert_source(),
        ));
        let scheduler = Arc::new(Scheduler::new(orchestrator, config.schedule_config()));
        Ok(Self {
            config,
            store,
            scheduler,
            started_at: Utc::now(),
        })
    }

    /// Initial fetch and schedule start, each as configured.
    pub async fn launch(&self) -> Result<()> {
        if self.config.initial_fetch {
            let outcomes = self.scheduler.trigger_immediate_fetch().await;
            let ok = outcomes.iter().filter(|o| o.success).count();
            info!(ok, total = outcomes.len(), "initial fetch finished");
        }
        if self.config.scheduler_enabled {
            self.scheduler.start().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await
    }
}

pub async fn run_sync_once_from_env() -> Result<Vec<FetchOutcome>> {
    let context = SyncContext::from_config(SyncConfig::from_env()).await?;
    Ok(context.scheduler.trigger_immediate_fetch().await)
}
