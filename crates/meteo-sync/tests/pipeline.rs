use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use meteo_core::{DataQuality, HealthStatus, SourceKind};
use meteo_storage::{SqliteStore, WeatherStore};
use meteo_sync::{SyncConfig, SyncContext};

#[derive(Clone)]
enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Stall,
}

/// Scripted replies per feed; the last reply repeats once the script runs out.
#[derive(Clone, Default)]
struct Feeds {
    forecast: Arc<Mutex<VecDeque<Reply>>>,
    alerts: Arc<Mutex<VecDeque<Reply>>>,
    forecast_hits: Arc<AtomicUsize>,
}

impl Feeds {
    fn script(&self, kind: SourceKind, replies: Vec<Reply>) {
        let queue = match kind {
            SourceKind::Forecast => &self.forecast,
            SourceKind::Alert => &self.alerts,
        };
        *queue.lock().unwrap() = replies.into();
    }
}

fn next_reply(queue: &Mutex<VecDeque<Reply>>) -> Reply {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().cloned().unwrap_or(Reply::Status(404))
    }
}

async fn respond(reply: Reply) -> Response {
    match reply {
        Reply::Body(body) => (StatusCode::OK, body).into_response(),
        Reply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Reply::Stall => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        }
    }
}

async fn forecast_feed(State(feeds): State<Feeds>) -> Response {
    feeds.forecast_hits.fetch_add(1, Ordering::SeqCst);
    let reply = next_reply(&feeds.forecast);
    respond(reply).await
}

async fn alert_feed(State(feeds): State<Feeds>) -> Response {
    let reply = next_reply(&feeds.alerts);
    respond(reply).await
}

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/anm")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}

fn one_day_forecast(temp_min: i32, temp_max: i32) -> Reply {
    Reply::Body(
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Prognoza_Oraselor>
  <localitate nume="Iasi">
    <DataPrognozei>2026-01-15</DataPrognozei>
    <prognoza data="2026-01-16">
      <temp_min>{temp_min}</temp_min>
      <temp_max>{temp_max}</temp_max>
      <fenomen_descriere>Cer senin</fenomen_descriere>
      <fenomen_simbol>1</fenomen_simbol>
    </prognoza>
  </localitate>
</Prognoza_Oraselor>"#
        )
        .into_bytes(),
    )
}

struct Harness {
    feeds: Feeds,
    store: Arc<SqliteStore>,
    context: SyncContext,
}

async fn harness() -> Harness {
    let feeds = Feeds::default();
    feeds.script(SourceKind::Forecast, vec![Reply::Body(fixture("prognoza-orase.xml"))]);
    feeds.script(SourceKind::Alert, vec![Reply::Body(fixture("avertizari.rss"))]);

    let app = Router::new()
        .route("/anm/prognoza-orase-xml.php", get(forecast_feed))
        .route("/anm2/avertizari-rss.php", get(alert_feed))
        .with_state(feeds.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = SyncConfig::from_lookup(|_| None);
    config.forecast_url = format!("http://{addr}/anm/prognoza-orase-xml.php");
    config.alerts_url = format!("http://{addr}/anm2/avertizari-rss.php");
    config.http_timeout_secs = 1;
    config.http_backoff_ms = 10;

    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let context = SyncContext::with_store(config, store.clone()).unwrap();
    Harness {
        feeds,
        store,
        context,
    }
}

#[tokio::test]
async fn partially_valid_forecast_is_stored_and_accounted() {
    let h = harness().await;
    let orchestrator = h.context.scheduler.orchestrator();

    let outcome = orchestrator.ingest(SourceKind::Forecast).await;

    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.data_quality, DataQuality::Partial);
    assert_eq!(outcome.entries_added, 8);
    assert_eq!(outcome.total_entries, 10);
    assert_eq!(outcome.error_message, None);

    assert_eq!(
        orchestrator.available_cities().await,
        vec!["Bucuresti", "Cluj-Napoca", "Constanta"]
    );
    assert_eq!(h.store.data_summary().await.unwrap().forecast_entries, 8);

    let health = h.store.source_health_snapshot().await.unwrap();
    let forecast = health
        .iter()
        .find(|r| r.source_type == SourceKind::Forecast)
        .unwrap();
    assert_eq!(forecast.fetch_count, 1);
    assert_eq!(forecast.success_count, 1);
    assert_eq!(forecast.status, HealthStatus::Ok);
    assert_eq!(forecast.data_quality, DataQuality::Partial);
    assert_eq!(forecast.entries_count, 8);
    assert!(forecast.is_fresh);
}

#[tokio::test]
async fn repeated_alert_feed_adds_nothing_new() {
    let h = harness().await;
    let orchestrator = h.context.scheduler.orchestrator();

    let first = orchestrator.ingest(SourceKind::Alert).await;
    let second = orchestrator.ingest(SourceKind::Alert).await;

    assert_eq!(first.entries_added, 3);
    assert_eq!(first.data_quality, DataQuality::Valid);
    assert!(second.success);
    assert_eq!(second.entries_added, 0);
    assert_eq!(second.total_entries, 3);
    assert_eq!(h.store.active_alert_count().await.unwrap(), 3);
}

#[tokio::test]
async fn republished_forecast_replaces_the_previous_values() {
    let h = harness().await;
    h.feeds.script(
        SourceKind::Forecast,
        vec![one_day_forecast(-1, 3), one_day_forecast(2, 8)],
    );
    let orchestrator = h.context.scheduler.orchestrator();

    orchestrator.ingest(SourceKind::Forecast).await;
    let outcome = orchestrator.ingest(SourceKind::Forecast).await;
    assert_eq!(outcome.entries_added, 1);

    let rows = h.store.forecasts_for_city("Iasi").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].record.temp_min, rows[0].record.temp_max), (2, 8));
    assert_eq!(rows[0].record.conditions, "Clear Sky");
}

#[tokio::test]
async fn unavailable_source_then_timeout_records_one_failure() {
    let h = harness().await;
    h.feeds.script(
        SourceKind::Forecast,
        vec![
            Reply::Status(503),
            Reply::Status(503),
            Reply::Status(503),
            Reply::Stall,
        ],
    );
    let orchestrator = h.context.scheduler.orchestrator();

    let outcome = orchestrator.ingest(SourceKind::Forecast).await;

    assert!(!outcome.success);
    assert_eq!(outcome.data_quality, DataQuality::Unavailable);
    assert_eq!(outcome.entries_added, 0);
    let message = outcome.error_message.unwrap();
    assert!(message.starts_with("Request timed out after"), "{message}");
    assert_eq!(h.feeds.forecast_hits.load(Ordering::SeqCst), 4);

    assert_eq!(h.store.data_summary().await.unwrap().forecast_entries, 0);
    assert!(orchestrator.available_cities().await.is_empty());

    let health = h.store.source_health_snapshot().await.unwrap();
    let forecast = health
        .iter()
        .find(|r| r.source_type == SourceKind::Forecast)
        .unwrap();
    assert_eq!(forecast.consecutive_failures, 1);
    assert_eq!(forecast.error_count, 1);
    assert_eq!(forecast.status, HealthStatus::Error);
    assert_eq!(forecast.last_success_at, None);
}

#[tokio::test]
async fn plain_text_maintenance_page_is_rejected() {
    let h = harness().await;
    h.feeds.script(
        SourceKind::Alert,
        vec![Reply::Body(b"Service temporarily unavailable, try again later".to_vec())],
    );

    let outcome = h
        .context
        .scheduler
        .orchestrator()
        .ingest(SourceKind::Alert)
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_message.as_deref(), Some("Invalid XML structure"));
    assert_eq!(outcome.data_quality, DataQuality::Unavailable);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_reports_both_sources_and_scheduler_lifecycle() {
    let h = harness().await;
    let scheduler = &h.context.scheduler;

    assert!(scheduler.sync_status().await.is_none());
    let outcomes = scheduler.trigger_immediate_fetch().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].source_type, SourceKind::Forecast);
    assert_eq!(outcomes[1].source_type, SourceKind::Alert);

    let status = scheduler.sync_status().await.unwrap();
    assert!(status.forecast_healthy && status.alert_healthy);
    assert_eq!(status.overall_quality, DataQuality::Valid);
    assert_eq!(status.cities_available, 3);
    assert_eq!(status.active_alerts, 3);
    assert_eq!(scheduler.last_results().await.len(), 2);
    assert_eq!(scheduler.available_cities().await.len(), 3);

    scheduler.start().await.unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.is_running());
    let info = scheduler.scheduler_info().await;
    assert!(info.is_running);
    assert_eq!(
        (info.forecast_interval_minutes, info.alert_interval_minutes),
        (60, 10)
    );

    scheduler.stop().await.unwrap();
    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn busy_source_drops_the_scheduled_tick() {
    let h = harness().await;
    h.feeds.script(SourceKind::Forecast, vec![Reply::Stall]);
    let scheduler = h.context.scheduler.clone();

    let in_flight = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.orchestrator().ingest(SourceKind::Forecast).await })
    };
    while h.feeds.forecast_hits.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(scheduler.tick(SourceKind::Forecast).await.is_none());
    assert!(scheduler.tick(SourceKind::Alert).await.is_some());

    let outcome = in_flight.await.unwrap();
    assert!(!outcome.success);
}
