use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use meteo_adapters::{
    AdapterContext, AnmAlertAdapter, AnmForecastAdapter, ParsedBatch, SourceAdapter,
};
use meteo_core::{
    DataQuality, FetchOutcome, HealthObservation, SourceDescriptor, SourceKind, SyncStatus,
};
use meteo_storage::{HttpFetcher, StoreError, WeatherStore};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::PipelineError;

/// Fetch, parse, persist and account for one source at a time.
///
/// Each source has its own execution lock, so a scheduled tick and an ad-hoc
/// trigger for the same source never overlap while the two sources still run
/// independently of each other.
pub struct Orchestrator {
    store: Arc<dyn WeatherStore>,
    http: HttpFetcher,
    forecast_source: SourceDescriptor,
    alert_source: SourceDescriptor,
    forecast_adapter: AnmForecastAdapter,
    alert_adapter: AnmAlertAdapter,
    forecast_lock: Mutex<()>,
    alert_lock: Mutex<()>,
    cities: RwLock<Vec<String>>,
    last_results: RwLock<HashMap<SourceKind, FetchOutcome>>,
}

struct Persisted {
    added: u64,
    total: u64,
    valid: u64,
    quality: DataQuality,
    response_time_ms: u64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn WeatherStore>,
        http: HttpFetcher,
        forecast_source: SourceDescriptor,
        alert_source: SourceDescriptor,
    ) -> Self {
        Self {
            store,
            http,
            forecast_source,
            alert_source,
            forecast_adapter: AnmForecastAdapter,
            alert_adapter: AnmAlertAdapter,
            forecast_lock: Mutex::new(()),
            alert_lock: Mutex::new(()),
            cities: RwLock::new(Vec::new()),
            last_results: RwLock::new(HashMap::new()),
        }
    }

    pub fn source(&self, kind: SourceKind) -> &SourceDescriptor {
        match kind {
            SourceKind::Forecast => &self.forecast_source,
            SourceKind::Alert => &self.alert_source,
        }
    }

    fn lock_for(&self, kind: SourceKind) -> &Mutex<()> {
        match kind {
            SourceKind::Forecast => &self.forecast_lock,
            SourceKind::Alert => &self.alert_lock,
        }
    }

    /// Run one ingestion, waiting for any run already in flight for `kind`.
    pub async fn ingest(&self, kind: SourceKind) -> FetchOutcome {
        let guard = self.lock_for(kind).lock().await;
        self.ingest_locked(kind, guard).await
    }

    /// Run one ingestion unless one is already in flight for `kind`.
    pub async fn try_ingest(&self, kind: SourceKind) -> Option<FetchOutcome> {
        let guard = self.lock_for(kind).try_lock().ok()?;
        Some(self.ingest_locked(kind, guard).await)
    }

    /// Wait until no run is in flight for `kind`.
    pub async fn wait_idle(&self, kind: SourceKind) {
        drop(self.lock_for(kind).lock().await);
    }

    async fn ingest_locked(&self, kind: SourceKind, _guard: MutexGuard<'_, ()>) -> FetchOutcome {
        let run_id = Uuid::new_v4();
        let source = self.source(kind);
        let span = info_span!("ingest", %run_id, source_id = %source.source_id);
        self.run_source(run_id, source).instrument(span).await
    }

    async fn run_source(&self, run_id: Uuid, source: &SourceDescriptor) -> FetchOutcome {
        let fetch_time = Utc::now();
        let started = Instant::now();

        let result = match source.kind {
            SourceKind::Forecast => self.ingest_forecasts(run_id, source).await,
            SourceKind::Alert => self.ingest_alerts(run_id, source).await,
        };

        let (outcome, observation) = match result {
            Ok(done) => {
                info!(
                    valid = done.valid,
                    total = done.total,
                    added = done.added,
                    quality = %done.quality,
                    "ingestion finished"
                );
                let outcome = FetchOutcome {
                    source_url: source.url.clone(),
                    source_type: source.kind,
                    source_name: source.source_name.clone(),
                    success: true,
                    entries_added: done.added,
                    total_entries: done.total,
                    error_message: None,
                    fetch_time,
                    data_quality: done.quality,
                    response_time_ms: done.response_time_ms,
                };
                let observation = HealthObservation {
                    observed_at: fetch_time,
                    success: true,
                    data_quality: done.quality,
                    is_fresh: true,
                    entries_count: done.valid,
                    error_message: None,
                    response_time_ms: done.response_time_ms,
                };
                (outcome, observation)
            }
            Err(err) => {
                match &err {
                    PipelineError::Fetch(inner) => error!(error = %inner, "fetch failed"),
                    PipelineError::Validation(inner) => error!(error = %inner, "payload rejected"),
                }
                let elapsed = elapsed_ms(started);
                let message = err.to_string();
                let outcome = FetchOutcome {
                    source_url: source.url.clone(),
                    source_type: source.kind,
                    source_name: source.source_name.clone(),
                    success: false,
                    entries_added: 0,
                    total_entries: 0,
                    error_message: Some(message.clone()),
                    fetch_time,
                    data_quality: DataQuality::Unavailable,
                    response_time_ms: elapsed,
                };
                let observation = HealthObservation {
                    observed_at: fetch_time,
                    success: false,
                    data_quality: DataQuality::Unavailable,
                    is_fresh: false,
                    entries_count: 0,
                    error_message: Some(message),
                    response_time_ms: elapsed,
                };
                (outcome, observation)
            }
        };

        if let Err(err) = self.store.upsert_source_health(source, &observation).await {
            error!(error = %err, "failed to record source health");
        }

        self.last_results
            .write()
            .await
            .insert(source.kind, outcome.clone());
        outcome
    }

    async fn fetch_and_parse<A: SourceAdapter>(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
        adapter: &A,
    ) -> Result<(ParsedBatch<A::Record>, u64), PipelineError> {
        let payload = self
            .http
            .fetch_bytes(run_id, &source.source_id, &source.url)
            .await?;
        let ctx = AdapterContext::new(run_id, source.url.clone());
        let batch = adapter.parse(&payload.body, &ctx)?;
        Ok((batch, payload.elapsed_ms))
    }

    async fn ingest_forecasts(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<Persisted, PipelineError> {
        let (batch, response_time_ms) = self
            .fetch_and_parse(run_id, source, &self.forecast_adapter)
            .await?;

        let mut cities = batch
            .records
            .iter()
            .map(|r| r.city.clone())
            .collect::<Vec<_>>();
        cities.sort();
        cities.dedup();
        *self.cities.write().await = cities;

        let mut added = 0u64;
        for record in &batch.records {
            match self.store.replace_forecast(record).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => log_store_error(&err, &record.city, &record.forecast_date),
            }
        }

        Ok(summarize(&batch, added, response_time_ms))
    }

    async fn ingest_alerts(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<Persisted, PipelineError> {
        let (batch, response_time_ms) = self
            .fetch_and_parse(run_id, source, &self.alert_adapter)
            .await?;

        let mut added = 0u64;
        for record in &batch.records {
            match self.store.insert_alert_if_new(record).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => log_store_error(&err, &record.title, &record.content_hash),
            }
        }

        Ok(summarize(&batch, added, response_time_ms))
    }

    /// Retire alerts older than `retention`. Failures are logged, never raised.
    pub async fn expire_alerts(&self, retention: Duration) -> u64 {
        match self.store.deactivate_alerts_older_than(retention).await {
            Ok(changed) => changed,
            Err(err) => {
                warn!(error = %err, "failed to deactivate expired alerts");
                0
            }
        }
    }

    /// Cities seen in the most recent successful forecast parse, sorted.
    pub async fn available_cities(&self) -> Vec<String> {
        self.cities.read().await.clone()
    }

    /// Latest outcome per source, forecast first.
    pub async fn last_results(&self) -> Vec<FetchOutcome> {
        let results = self.last_results.read().await;
        [SourceKind::Forecast, SourceKind::Alert]
            .iter()
            .filter_map(|kind| results.get(kind).cloned())
            .collect()
    }

    pub async fn compute_sync_status(&self) -> SyncStatus {
        let active_alerts = match self.store.active_alert_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "could not count active alerts");
                0
            }
        };
        let cities = self.cities.read().await.len() as u64;
        let results = self.last_results.read().await;
        SyncStatus::derive(
            Utc::now(),
            results.get(&SourceKind::Forecast),
            results.get(&SourceKind::Alert),
            cities,
            active_alerts,
        )
    }
}

fn summarize<T>(batch: &ParsedBatch<T>, added: u64, response_time_ms: u64) -> Persisted {
    Persisted {
        added,
        total: batch.total as u64,
        valid: batch.valid as u64,
        quality: batch.quality(),
        response_time_ms,
    }
}

fn log_store_error(err: &StoreError, key: &str, detail: &str) {
    warn!(error = %err, key, detail, "failed to persist record");
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
