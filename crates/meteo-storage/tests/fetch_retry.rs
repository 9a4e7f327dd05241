use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use meteo_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

#[derive(Clone)]
struct Script {
    hits: Arc<AtomicUsize>,
    /// Status returned for each hit in order; past the end the handler stalls.
    statuses: Arc<Vec<u16>>,
}

async fn scripted(State(script): State<Script>) -> impl IntoResponse {
    let hit = script.hits.fetch_add(1, Ordering::SeqCst);
    match script.statuses.get(hit) {
        Some(200) => (StatusCode::OK, "<?xml version=\"1.0\"?><Prognoza/>").into_response(),
        Some(code) => StatusCode::from_u16(*code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        None => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        }
    }
}

async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let script = Script {
        hits: hits.clone(),
        statuses: Arc::new(statuses),
    };
    let app = Router::new().route("/feed", get(scripted)).with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/feed"), hits)
}

fn fast_fetcher(timeout: Duration) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout,
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        ..HttpClientConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn three_unavailable_then_timeout_surfaces_timeout() {
    let (url, hits) = serve(vec![503, 503, 503]).await;
    let fetcher = fast_fetcher(Duration::from_millis(300));

    let err = fetcher
        .fetch_bytes(Uuid::new_v4(), "anm_forecast", &url)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    assert!(err.to_string().starts_with("Request timed out after"));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let (url, hits) = serve(vec![404, 200]).await;
    let fetcher = fast_fetcher(Duration::from_secs(2));

    let err = fetcher
        .fetch_bytes(Uuid::new_v4(), "anm_alerts", &url)
        .await
        .unwrap_err();

    match err {
        FetchError::HttpStatus { status, .. } => assert_eq!(status, 404),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_status_recovers_on_retry() {
    let (url, hits) = serve(vec![503, 429, 200]).await;
    let fetcher = fast_fetcher(Duration::from_secs(2));

    let payload = fetcher
        .fetch_bytes(Uuid::new_v4(), "anm_forecast", &url)
        .await
        .unwrap();

    assert_eq!(payload.status.as_u16(), 200);
    assert!(payload.body.starts_with(b"<?xml"));
    assert!(payload.final_url.ends_with("/feed"));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unreachable_host_is_reported_as_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        },
        ..HttpClientConfig::default()
    })
    .unwrap();

    let err = fetcher
        .fetch_bytes(Uuid::new_v4(), "anm_alerts", &format!("http://{addr}/rss"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unreachable(_)), "got {err:?}");
    assert!(err.to_string().starts_with("Connection error - source unavailable"));
}
