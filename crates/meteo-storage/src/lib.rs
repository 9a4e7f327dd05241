//! HTTP fetch utilities and the persistence contract for the weather pipeline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use meteo_core::{
    AlertRecord, DataSummary, ForecastRecord, HealthObservation, SourceDescriptor,
    SourceHealthRecord,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod sqlite;

pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "meteo-storage";

pub const DEFAULT_USER_AGENT: &str = concat!("meteo-fetcher/", env!("CARGO_PKG_VERSION"));

const FEED_ACCEPT: &str = "application/xml, text/xml, application/rss+xml, */*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and every 5xx are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out after {}s", .after.as_secs())]
    Timeout {
        after: Duration,
        #[source]
        source: reqwest::Error,
    },
    #[error("Connection error - source unavailable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("HTTP error {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Shared HTTP client. Clones of the inner `reqwest::Client` share one
/// connection pool, so one fetcher serves both source jobs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Request)?;
        Ok(Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    fn classify_failure(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                after: self.timeout,
                source: err,
            }
        } else if err.is_connect() {
            FetchError::Unreachable(err)
        } else {
            FetchError::Request(err)
        }
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    /// `elapsed_ms` spans the whole logical fetch, retries included.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPayload, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPayload, FetchError> {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            let can_retry = attempt < self.backoff.max_retries;
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedPayload {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    elapsed_ms: started.elapsed().as_millis() as u64,
                                });
                            }
                            Err(err) => err,
                        }
                    } else {
                        if classify_status(status) == RetryDisposition::Retryable && can_retry {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(status = status.as_u16(), attempt, ?delay, "retryable status, backing off");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(error = %err, attempt, ?delay, "transient request error, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(self.classify_failure(err));
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[source] sqlx::Error),
    #[error("corrupt row in {table}: {detail}")]
    Decode { table: &'static str, detail: String },
}

/// A persisted row together with its surrogate key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow<T> {
    pub id: i64,
    #[serde(flatten)]
    pub record: T,
}

/// Persistence capability the ingestion pipeline calls into. Implementations
/// serialize writes; reads may run concurrently.
#[async_trait]
pub trait WeatherStore: Send + Sync {
    /// Delete any row for (city, forecast_date), then insert `record`.
    async fn replace_forecast(&self, record: &ForecastRecord) -> Result<bool, StoreError>;

    /// Insert unless `content_hash` is already known. Returns whether a row was added.
    async fn insert_alert_if_new(&self, record: &AlertRecord) -> Result<bool, StoreError>;

    async fn upsert_source_health(
        &self,
        source: &SourceDescriptor,
        observation: &HealthObservation,
    ) -> Result<SourceHealthRecord, StoreError>;

    async fn cities(&self) -> Result<Vec<String>, StoreError>;

    async fn search_cities(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn forecasts_for_city(
        &self,
        city: &str,
    ) -> Result<Vec<StoredRow<ForecastRecord>>, StoreError>;

    async fn active_alerts(&self, limit: u32) -> Result<Vec<StoredRow<AlertRecord>>, StoreError>;

    async fn alerts_by_level(&self, level: &str)
        -> Result<Vec<StoredRow<AlertRecord>>, StoreError>;

    async fn active_alert_count(&self) -> Result<u64, StoreError>;

    async fn source_health_snapshot(&self) -> Result<Vec<SourceHealthRecord>, StoreError>;

    async fn data_summary(&self) -> Result<DataSummary, StoreError>;

    /// Mark alerts fetched more than `max_age` ago inactive. Returns how many changed.
    async fn deactivate_alerts_older_than(&self, max_age: Duration) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(3000));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn default_config_identifies_itself() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.backoff.max_retries, 3);
        assert!(config
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.starts_with("meteo-fetcher/")));
    }
}
