use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use meteo_core::{
    AlertRecord, DataSummary, ForecastRecord, HealthObservation, SourceDescriptor,
    SourceHealthRecord,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{StoreError, StoredRow, WeatherStore};

const SEARCH_LIMIT: i64 = 20;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS city_forecasts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        city TEXT NOT NULL,
        forecast_date TEXT NOT NULL,
        data_date TEXT NOT NULL DEFAULT '',
        temp_min INTEGER NOT NULL,
        temp_max INTEGER NOT NULL,
        conditions TEXT NOT NULL,
        conditions_code TEXT NOT NULL DEFAULT '',
        source_url TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        UNIQUE(city, forecast_date)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_city_forecasts_city ON city_forecasts(city)",
    r#"
    CREATE TABLE IF NOT EXISTS weather_alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        published_at TEXT,
        link TEXT,
        alert_level TEXT,
        affected_zones TEXT,
        time_range TEXT,
        source_url TEXT NOT NULL,
        content_hash TEXT NOT NULL UNIQUE,
        fetched_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_weather_alerts_active ON weather_alerts(is_active, fetched_at)",
    r#"
    CREATE TABLE IF NOT EXISTS source_status (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_url TEXT NOT NULL UNIQUE,
        source_type TEXT NOT NULL,
        source_name TEXT NOT NULL,
        last_fetch_at TEXT,
        last_success_at TEXT,
        fetch_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        status TEXT NOT NULL,
        data_quality TEXT NOT NULL,
        is_fresh INTEGER NOT NULL DEFAULT 0,
        avg_response_time_ms REAL NOT NULL DEFAULT 0,
        last_response_time_ms INTEGER NOT NULL DEFAULT 0,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        entries_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

/// SQLite-backed [`WeatherStore`]. Writes go through a single async guard so
/// the read-modify-write health upsert never interleaves.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (creating if missing) a file database such as `sqlite://weather.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. One connection that never recycles, so the
    /// schema lives as long as the store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Migration)?;
        }
        debug!(statements = SCHEMA.len(), "schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_health(&self, source_url: &str) -> Result<Option<SourceHealthRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM source_status WHERE source_url = ?")
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(health_from_row).transpose()
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Decode {
            table,
            detail: format!("bad timestamp {raw:?}: {err}"),
        })
}

fn decode_opt_ts(table: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(|raw| decode_ts(table, raw)).transpose()
}

fn decode_enum<T>(table: &'static str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| StoreError::Decode {
        table,
        detail: err.to_string(),
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn forecast_from_row(row: &SqliteRow) -> Result<StoredRow<ForecastRecord>, StoreError> {
    let fetched_at: String = row.try_get("fetched_at")?;
    Ok(StoredRow {
        id: row.try_get("id")?,
        record: ForecastRecord {
            city: row.try_get("city")?,
            forecast_date: row.try_get("forecast_date")?,
            data_date: row.try_get("data_date")?,
            temp_min: row.try_get("temp_min")?,
            temp_max: row.try_get("temp_max")?,
            conditions: row.try_get("conditions")?,
            conditions_code: row.try_get("conditions_code")?,
            source_url: row.try_get("source_url")?,
            content_hash: row.try_get("content_hash")?,
            fetched_at: decode_ts("city_forecasts", &fetched_at)?,
        },
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<StoredRow<AlertRecord>, StoreError> {
    let fetched_at: String = row.try_get("fetched_at")?;
    Ok(StoredRow {
        id: row.try_get("id")?,
        record: AlertRecord {
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            published_at: row.try_get("published_at")?,
            link: row.try_get("link")?,
            alert_level: row.try_get("alert_level")?,
            affected_zones: row.try_get("affected_zones")?,
            time_range: row.try_get("time_range")?,
            source_url: row.try_get("source_url")?,
            content_hash: row.try_get("content_hash")?,
            fetched_at: decode_ts("weather_alerts", &fetched_at)?,
            is_active: row.try_get("is_active")?,
        },
    })
}

fn health_from_row(row: &SqliteRow) -> Result<SourceHealthRecord, StoreError> {
    const TABLE: &str = "source_status";
    let source_type: String = row.try_get("source_type")?;
    let status: String = row.try_get("status")?;
    let data_quality: String = row.try_get("data_quality")?;
    Ok(SourceHealthRecord {
        source_url: row.try_get("source_url")?,
        source_type: decode_enum(TABLE, &source_type)?,
        source_name: row.try_get("source_name")?,
        last_fetch_at: decode_opt_ts(TABLE, row.try_get("last_fetch_at")?)?,
        last_success_at: decode_opt_ts(TABLE, row.try_get("last_success_at")?)?,
        fetch_count: count(row.try_get("fetch_count")?),
        success_count: count(row.try_get("success_count")?),
        error_count: count(row.try_get("error_count")?),
        last_error: row.try_get("last_error")?,
        status: decode_enum(TABLE, &status)?,
        data_quality: decode_enum(TABLE, &data_quality)?,
        is_fresh: row.try_get("is_fresh")?,
        avg_response_time_ms: row.try_get("avg_response_time_ms")?,
        last_response_time_ms: count(row.try_get("last_response_time_ms")?),
        consecutive_failures: count(row.try_get("consecutive_failures")?),
        entries_count: count(row.try_get("entries_count")?),
    })
}

#[async_trait]
impl WeatherStore for SqliteStore {
    async fn replace_forecast(&self, record: &ForecastRecord) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM city_forecasts WHERE city = ? AND forecast_date = ?")
            .bind(&record.city)
            .bind(&record.forecast_date)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO city_forecasts
                (city, forecast_date, data_date, temp_min, temp_max, conditions,
                 conditions_code, source_url, content_hash, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.city)
        .bind(&record.forecast_date)
        .bind(&record.data_date)
        .bind(record.temp_min)
        .bind(record.temp_max)
        .bind(&record.conditions)
        .bind(&record.conditions_code)
        .bind(&record.source_url)
        .bind(&record.content_hash)
        .bind(encode_ts(record.fetched_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn insert_alert_if_new(&self, record: &AlertRecord) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO weather_alerts
                (title, description, published_at, link, alert_level, affected_zones,
                 time_range, source_url, content_hash, fetched_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.published_at)
        .bind(&record.link)
        .bind(&record.alert_level)
        .bind(&record.affected_zones)
        .bind(&record.time_range)
        .bind(&record.source_url)
        .bind(&record.content_hash)
        .bind(encode_ts(record.fetched_at))
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_source_health(
        &self,
        source: &SourceDescriptor,
        observation: &HealthObservation,
    ) -> Result<SourceHealthRecord, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut record = self
            .load_health(&source.url)
            .await?
            .unwrap_or_else(|| SourceHealthRecord::new(source));
        record.source_name = source.source_name.clone();
        record.source_type = source.kind;
        record.record(observation);

        sqlx::query(
            r#"
            INSERT INTO source_status
                (source_url, source_type, source_name, last_fetch_at, last_success_at,
                 fetch_count, success_count, error_count, last_error, status, data_quality,
                 is_fresh, avg_response_time_ms, last_response_time_ms,
                 consecutive_failures, entries_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_url) DO UPDATE SET
                source_type = excluded.source_type,
                source_name = excluded.source_name,
                last_fetch_at = excluded.last_fetch_at,
                last_success_at = excluded.last_success_at,
                fetch_count = excluded.fetch_count,
                success_count = excluded.success_count,
                error_count = excluded.error_count,
                last_error = excluded.last_error,
                status = excluded.status,
                data_quality = excluded.data_quality,
                is_fresh = excluded.is_fresh,
                avg_response_time_ms = excluded.avg_response_time_ms,
                last_response_time_ms = excluded.last_response_time_ms,
                consecutive_failures = excluded.consecutive_failures,
                entries_count = excluded.entries_count
            "#,
        )
        .bind(&record.source_url)
        .bind(record.source_type.as_str())
        .bind(&record.source_name)
        .bind(record.last_fetch_at.map(encode_ts))
        .bind(record.last_success_at.map(encode_ts))
        .bind(record.fetch_count as i64)
        .bind(record.success_count as i64)
        .bind(record.error_count as i64)
        .bind(&record.last_error)
        .bind(record.status.as_str())
        .bind(record.data_quality.as_str())
        .bind(record.is_fresh)
        .bind(record.avg_response_time_ms)
        .bind(record.last_response_time_ms as i64)
        .bind(record.consecutive_failures as i64)
        .bind(record.entries_count as i64)
        .execute(&self.pool)
        .await?;

        debug!(
            source_url = %record.source_url,
            fetch_count = record.fetch_count,
            consecutive_failures = record.consecutive_failures,
            "source health updated"
        );
        Ok(record)
    }

    async fn cities(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT city FROM city_forecasts ORDER BY city")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("city").map_err(StoreError::from))
            .collect()
    }

    async fn search_cities(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT city FROM city_forecasts
             WHERE city LIKE ? || '%' ESCAPE '\'
             ORDER BY city
             LIMIT ?
            "#,
        )
        .bind(escape_like(prefix))
        .bind(SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("city").map_err(StoreError::from))
            .collect()
    }

    async fn forecasts_for_city(
        &self,
        city: &str,
    ) -> Result<Vec<StoredRow<ForecastRecord>>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM city_forecasts WHERE city = ? ORDER BY forecast_date",
        )
        .bind(city)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(forecast_from_row).collect()
    }

    async fn active_alerts(&self, limit: u32) -> Result<Vec<StoredRow<AlertRecord>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM weather_alerts
             WHERE is_active = 1
             ORDER BY published_at DESC, fetched_at DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn alerts_by_level(
        &self,
        level: &str,
    ) -> Result<Vec<StoredRow<AlertRecord>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM weather_alerts
             WHERE is_active = 1 AND alert_level = ?
             ORDER BY published_at DESC, fetched_at DESC, id DESC
            "#,
        )
        .bind(level.to_uppercase())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn active_alert_count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM weather_alerts WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count(total))
    }

    async fn source_health_snapshot(&self) -> Result<Vec<SourceHealthRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM source_status ORDER BY source_type, source_url")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(health_from_row).collect()
    }

    async fn data_summary(&self) -> Result<DataSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM city_forecasts) AS forecast_entries,
                (SELECT COUNT(*) FROM weather_alerts WHERE is_active = 1) AS alert_entries,
                (SELECT COUNT(DISTINCT city) FROM city_forecasts) AS city_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let forecast_entries = count(row.try_get("forecast_entries")?);
        let alert_entries = count(row.try_get("alert_entries")?);
        Ok(DataSummary {
            forecast_entries,
            alert_entries,
            city_count: count(row.try_get("city_count")?),
            total_entries: forecast_entries + alert_entries,
        })
    }

    async fn deactivate_alerts_older_than(&self, max_age: Duration) -> Result<u64, StoreError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE weather_alerts SET is_active = 0 WHERE is_active = 1 AND fetched_at < ?",
        )
        .bind(encode_ts(cutoff))
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected();
        if changed > 0 {
            info!(changed, cutoff = %cutoff, "deactivated expired alerts");
        }
        Ok(changed)
    }
}

/// LIKE wildcards in user input match literally.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
