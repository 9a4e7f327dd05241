//! Core domain model for the ANM weather ingestion pipeline.
//!
//! Holds the two record shapes (state-based forecasts and event-based alerts),
//! the per-source health record, and the pure helpers shared by every other
//! crate: content fingerprinting, quality assessment and health accounting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "meteo-core";

pub const FORECAST_SOURCE_ID: &str = "anm_forecast";
pub const ALERT_SOURCE_ID: &str = "anm_alerts";

/// Consistency model of an upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Full snapshot, latest fetch replaces the previous one.
    Forecast,
    /// Append-only log of distinct events.
    Alert,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Forecast => "forecast",
            SourceKind::Alert => "alert",
        }
    }

    /// How old the last successful fetch may be before the data counts as stale.
    pub fn freshness_window(self) -> Duration {
        match self {
            SourceKind::Forecast => Duration::hours(12),
            SourceKind::Alert => Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Valid,
    Partial,
    Invalid,
    Unavailable,
}

impl DataQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            DataQuality::Valid => "valid",
            DataQuality::Partial => "partial",
            DataQuality::Invalid => "invalid",
            DataQuality::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

macro_rules! str_enum_impls {
    ($ty:ty { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

str_enum_impls!(SourceKind { "forecast" => SourceKind::Forecast, "alert" => SourceKind::Alert });
str_enum_impls!(DataQuality {
    "valid" => DataQuality::Valid,
    "partial" => DataQuality::Partial,
    "invalid" => DataQuality::Invalid,
    "unavailable" => DataQuality::Unavailable,
});
str_enum_impls!(HealthStatus { "ok" => HealthStatus::Ok, "error" => HealthStatus::Error });

/// Static description of one upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub source_name: String,
    pub url: String,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn forecast(url: impl Into<String>) -> Self {
        Self {
            source_id: FORECAST_SOURCE_ID.to_string(),
            source_name: "ANM Romania Forecasts".to_string(),
            url: url.into(),
            kind: SourceKind::Forecast,
        }
    }

    pub fn alerts(url: impl Into<String>) -> Self {
        Self {
            source_id: ALERT_SOURCE_ID.to_string(),
            source_name: "ANM Romania Alerts".to_string(),
            url: url.into(),
            kind: SourceKind::Alert,
        }
    }
}

/// One city/day forecast. At most one live row per (city, forecast_date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub city: String,
    pub forecast_date: String,
    pub data_date: String,
    pub temp_min: i32,
    pub temp_max: i32,
    pub conditions: String,
    pub conditions_code: String,
    pub source_url: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// One weather warning. `content_hash` is unique across the alert log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub title: String,
    pub description: String,
    pub published_at: Option<String>,
    pub link: Option<String>,
    pub alert_level: Option<String>,
    pub affected_zones: Option<String>,
    pub time_range: Option<String>,
    pub source_url: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Stable SHA-256 digest over the `|`-joined parts.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Map (valid, total) entry counts to a quality level.
pub fn assess_quality(valid: usize, total: usize) -> DataQuality {
    if total == 0 {
        return DataQuality::Unavailable;
    }
    if valid == 0 {
        return DataQuality::Invalid;
    }
    if valid >= total {
        return DataQuality::Valid;
    }
    if valid * 2 >= total {
        DataQuality::Partial
    } else {
        DataQuality::Invalid
    }
}

/// What one fetch attempt contributes to the health record.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthObservation {
    pub observed_at: DateTime<Utc>,
    pub success: bool,
    pub data_quality: DataQuality,
    pub is_fresh: bool,
    pub entries_count: u64,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealthRecord {
    pub source_url: String,
    pub source_type: SourceKind,
    pub source_name: String,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub fetch_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub status: HealthStatus,
    pub data_quality: DataQuality,
    pub is_fresh: bool,
    pub avg_response_time_ms: f64,
    pub last_response_time_ms: u64,
    pub consecutive_failures: u64,
    pub entries_count: u64,
}

impl SourceHealthRecord {
    /// A record for a source that has never been fetched.
    pub fn new(source: &SourceDescriptor) -> Self {
        Self {
            source_url: source.url.clone(),
            source_type: source.kind,
            source_name: source.source_name.clone(),
            last_fetch_at: None,
            last_success_at: None,
            fetch_count: 0,
            success_count: 0,
            error_count: 0,
            last_error: None,
            status: HealthStatus::Error,
            data_quality: DataQuality::Unavailable,
            is_fresh: false,
            avg_response_time_ms: 0.0,
            last_response_time_ms: 0,
            consecutive_failures: 0,
            entries_count: 0,
        }
    }

    /// Fold one fetch attempt into the rolling record.
    pub fn record(&mut self, obs: &HealthObservation) {
        let sample = obs.response_time_ms as f64;
        self.avg_response_time_ms = if self.fetch_count == 0 {
            sample
        } else {
            let n = self.fetch_count as f64;
            (self.avg_response_time_ms * n + sample) / (n + 1.0)
        };
        self.fetch_count += 1;
        self.last_fetch_at = Some(obs.observed_at);
        self.last_response_time_ms = obs.response_time_ms;

        if obs.success {
            self.success_count += 1;
            self.last_success_at = Some(obs.observed_at);
            self.consecutive_failures = 0;
            self.last_error = None;
            self.status = HealthStatus::Ok;
        } else {
            self.error_count += 1;
            self.consecutive_failures += 1;
            self.last_error = obs.error_message.clone();
            self.status = HealthStatus::Error;
        }

        self.data_quality = obs.data_quality;
        self.is_fresh = obs.is_fresh;
        self.entries_count = obs.entries_count;
    }

    /// success / fetch × 100, one decimal; 0 before the first fetch.
    pub fn reliability_percent(&self) -> f64 {
        if self.fetch_count == 0 {
            return 0.0;
        }
        let pct = self.success_count as f64 / self.fetch_count as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_success_at {
            Some(at) => now - at > self.source_type.freshness_window(),
            None => true,
        }
    }
}

/// Result of one orchestrated ingestion run for a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub source_url: String,
    pub source_type: SourceKind,
    pub source_name: String,
    pub success: bool,
    pub entries_added: u64,
    pub total_entries: u64,
    pub error_message: Option<String>,
    pub fetch_time: DateTime<Utc>,
    pub data_quality: DataQuality,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub last_sync_time: DateTime<Utc>,
    pub forecast_healthy: bool,
    pub alert_healthy: bool,
    pub overall_quality: DataQuality,
    pub cities_available: u64,
    pub active_alerts: u64,
}

impl SyncStatus {
    pub fn derive(
        last_sync_time: DateTime<Utc>,
        forecast: Option<&FetchOutcome>,
        alert: Option<&FetchOutcome>,
        cities_available: u64,
        active_alerts: u64,
    ) -> Self {
        let forecast_healthy = forecast.is_some_and(|o| o.success);
        let alert_healthy = alert.is_some_and(|o| o.success);
        let overall_quality = match (forecast_healthy, alert_healthy) {
            (true, true) => DataQuality::Valid,
            (true, false) | (false, true) => DataQuality::Partial,
            (false, false) => DataQuality::Unavailable,
        };
        Self {
            last_sync_time,
            forecast_healthy,
            alert_healthy,
            overall_quality,
            cities_available,
            active_alerts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSummary {
    pub forecast_entries: u64,
    pub alert_entries: u64,
    pub city_count: u64,
    pub total_entries: u64,
}
