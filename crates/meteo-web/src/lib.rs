//! JSON façade over the weather store and the ingestion scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use meteo_core::{AlertRecord, ForecastRecord, SourceHealthRecord, SyncStatus};
use meteo_storage::{StoreError, StoredRow};
use meteo_sync::{SyncConfig, SyncContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "meteo-web";

const DEFAULT_CITY: &str = "Bucuresti";
const ALERT_LEVELS: [&str; 3] = ["YELLOW", "ORANGE", "RED"];

#[derive(Clone)]
pub struct AppState {
    pub context: SyncContext,
}

impl AppState {
    pub fn new(context: SyncContext) -> Self {
        Self { context }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsQuery {
    limit: Option<i64>,
    level: Option<String>,
}

/// Source health as stored, plus figures derived at read time.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealthView {
    #[serde(flatten)]
    pub record: SourceHealthRecord,
    pub reliability_percent: f64,
    pub is_stale: bool,
}

impl SourceHealthView {
    pub fn at(record: SourceHealthRecord, now: DateTime<Utc>) -> Self {
        Self {
            reliability_percent: record.reliability_percent(),
            is_stale: record.is_stale_at(now),
            record,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/cities", get(cities_handler))
        .route("/cities/search", get(search_cities_handler))
        .route("/forecast", get(default_forecast_handler))
        .route("/forecast/{city}", get(city_forecast_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/count", get(alert_count_handler))
        .route("/status", get(status_handler))
        .route("/sources", get(sources_handler))
        .route("/fetch", post(fetch_handler))
        .route("/fetch/results", get(fetch_results_handler))
        .with_state(Arc::new(state))
}

/// Build the pipeline from the environment, run it, and serve until Ctrl-C.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let host = std::env::var("METEO_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("METEO_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let context = SyncContext::from_config(SyncConfig::from_env()).await?;
    context.launch().await?;

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(%host, port, "serving weather api");
    axum::serve(listener, app(AppState::new(context.clone())))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    context.shutdown().await?;
    Ok(())
}

async fn index_handler() -> Response {
    Json(json!({
        "name": "Romania Weather API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Weather data from ANM Romania",
        "sources": {
            "forecasts": "ANM XML - State-based city forecasts",
            "alerts": "ANM RSS - Event-based weather warnings",
        },
    }))
    .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let ctx = &state.context;
    let (database, risks) = match ctx.store.source_health_snapshot().await {
        Ok(health) => (
            "connected",
            detect_risks(ctx.scheduler.sync_status().await.as_ref(), &health, Utc::now()),
        ),
        Err(err) => {
            error!(error = %err, "health check could not read the store");
            ("disconnected", vec!["Database unavailable".to_string()])
        }
    };
    Json(json!({
        "status": if risks.is_empty() { "healthy" } else { "degraded" },
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        "database": database,
        "scheduler": if ctx.scheduler.is_running() { "running" } else { "stopped" },
        "risks": risks,
    }))
    .into_response()
}

async fn cities_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.context.store.cities().await {
        Ok(cities) => Json(json!({ "count": cities.len(), "cities": cities })).into_response(),
        Err(err) => store_unavailable(err),
    }
}

async fn search_cities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let q = query.q.unwrap_or_default();
    if q.trim().is_empty() {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "query parameter q is required");
    }
    match state.context.store.search_cities(&q).await {
        Ok(cities) => {
            Json(json!({ "query": q, "count": cities.len(), "cities": cities })).into_response()
        }
        Err(err) => store_unavailable(err),
    }
}

async fn city_forecast_handler(
    State(state): State<Arc<AppState>>,
    Path(city): Path<String>,
) -> Response {
    match lookup_forecast(&state, &city).await {
        Ok(rows) if rows.is_empty() => detail(
            StatusCode::NOT_FOUND,
            &format!("No forecast found for city: {city}"),
        ),
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_unavailable(err),
    }
}

async fn default_forecast_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.context.store.forecasts_for_city(DEFAULT_CITY).await {
        Ok(rows) if rows.is_empty() => {
            detail(StatusCode::NOT_FOUND, "Bucharest forecast not available")
        }
        Ok(rows) => Json(json!({ "city": DEFAULT_CITY, "forecasts": rows })).into_response(),
        Err(err) => store_unavailable(err),
    }
}

/// Exact match first, then a case-insensitive match against known cities.
async fn lookup_forecast(
    state: &AppState,
    city: &str,
) -> Result<Vec<StoredRow<ForecastRecord>>, StoreError> {
    let store = &state.context.store;
    let rows = store.forecasts_for_city(city).await?;
    if !rows.is_empty() {
        return Ok(rows);
    }
    let wanted = city.to_lowercase();
    match store
        .cities()
        .await?
        .into_iter()
        .find(|known| known.to_lowercase() == wanted)
    {
        Some(known) => store.forecasts_for_city(&known).await,
        None => Ok(rows),
    }
}

async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    let store = &state.context.store;
    let limit = query.limit.unwrap_or(50).clamp(1, 100) as u32;
    let alerts = match query.level.as_deref().map(str::trim) {
        Some(level) if !level.is_empty() => store.alerts_by_level(level).await,
        _ => store.active_alerts(limit).await,
    };
    match alerts {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_unavailable(err),
    }
}

async fn alert_count_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.context.store.active_alerts(100).await {
        Ok(rows) => Json(json!({
            "total": rows.len(),
            "by_level": count_by_level(&rows),
        }))
        .into_response(),
        Err(err) => store_unavailable(err),
    }
}

fn count_by_level(rows: &[StoredRow<AlertRecord>]) -> BTreeMap<&'static str, usize> {
    let mut counts = ALERT_LEVELS
        .iter()
        .chain(std::iter::once(&"OTHER"))
        .map(|level| (*level, 0usize))
        .collect::<BTreeMap<_, _>>();
    for row in rows {
        let bucket = row
            .record
            .alert_level
            .as_deref()
            .and_then(|level| ALERT_LEVELS.iter().find(|known| **known == level))
            .copied()
            .unwrap_or("OTHER");
        *counts.entry(bucket).or_default() += 1;
    }
    counts
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let ctx = &state.context;
    let health = match ctx.store.source_health_snapshot().await {
        Ok(health) => health,
        Err(err) => return store_unavailable(err),
    };
    let summary = match ctx.store.data_summary().await {
        Ok(summary) => summary,
        Err(err) => return store_unavailable(err),
    };
    let sync_status = ctx.scheduler.sync_status().await;
    let now = Utc::now();
    let risks = detect_risks(sync_status.as_ref(), &health, now);
    let scheduler = ctx.scheduler.scheduler_info().await;

    Json(json!({
        "status": overall_status(risks.len()),
        "uptime": format_uptime((Utc::now() - ctx.started_at).num_seconds()),
        "scheduler_running": scheduler.is_running,
        "next_forecast_run": scheduler.next_forecast_run,
        "next_alert_run": scheduler.next_alert_run,
        "data_quality": sync_status.as_ref().map(|s| s.overall_quality.as_str()).unwrap_or("unknown"),
        "forecast_healthy": sync_status.as_ref().is_some_and(|s| s.forecast_healthy),
        "alert_healthy": sync_status.as_ref().is_some_and(|s| s.alert_healthy),
        "cities_available": summary.city_count,
        "active_alerts": summary.alert_entries,
        "total_forecasts": summary.forecast_entries,
        "source_health": health
            .into_iter()
            .map(|record| SourceHealthView::at(record, now))
            .collect::<Vec<_>>(),
        "risks": risks,
    }))
    .into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = &state.context.store;
    let health = match store.source_health_snapshot().await {
        Ok(health) => health,
        Err(err) => return store_unavailable(err),
    };
    let now = Utc::now();
    match store.data_summary().await {
        Ok(summary) => Json(json!({
            "sources": health
                .into_iter()
                .map(|record| SourceHealthView::at(record, now))
                .collect::<Vec<_>>(),
            "summary": summary,
        }))
        .into_response(),
        Err(err) => store_unavailable(err),
    }
}

async fn fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.context.scheduler.trigger_immediate_fetch().await).into_response()
}

async fn fetch_results_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.context.scheduler.last_results().await).into_response()
}

/// Human-readable reasons the data should not be fully trusted right now.
pub fn detect_risks(
    sync_status: Option<&SyncStatus>,
    health: &[SourceHealthRecord],
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut risks = Vec::new();
    if let Some(status) = sync_status {
        if !status.forecast_healthy {
            risks.push("Forecast source unavailable".to_string());
        }
        if !status.alert_healthy {
            risks.push("Alert source unavailable".to_string());
        }
    }
    for source in health {
        if source.consecutive_failures >= 3 {
            risks.push(format!("Source failing repeatedly: {}", source.source_name));
        }
        if source.reliability_percent() < 80.0 {
            risks.push(format!("Low reliability: {}", source.source_name));
        }
        if source.is_stale_at(now) {
            risks.push(format!("Stale data: {}", source.source_name));
        }
    }
    risks
}

fn overall_status(risk_count: usize) -> &'static str {
    match risk_count {
        0 => "healthy",
        1 => "degraded",
        _ => "unhealthy",
    }
}

fn format_uptime(total_secs: i64) -> String {
    let total = total_secs.max(0);
    let (hours, rest) = (total / 3600, total % 3600);
    format!("{hours}h {}m {}s", rest / 60, rest % 60)
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn store_unavailable(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    detail(StatusCode::SERVICE_UNAVAILABLE, "Database not available")
}
