//! Source adapters: turn raw ANM payloads into domain records.
//!
//! Adapters are parse-only. Fetching lives in `meteo-storage` and
//! persistence in the `WeatherStore` implementations, so a payload can be
//! parsed the same way whether it came off the wire or from a test fixture.

use chrono::{DateTime, Utc};
use meteo_core::{assess_quality, AlertRecord, DataQuality, ForecastRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod alerts;
mod forecast;
pub mod text;

pub use alerts::AnmAlertAdapter;
pub use forecast::AnmForecastAdapter;
pub use text::{clean_markup, translate_conditions};

pub const CRATE_NAME: &str = "meteo-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, source_url: impl Into<String>) -> Self {
        Self {
            run_id,
            source_url: source_url.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Whole-payload failure. The batch is rejected and nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Empty response")]
    EmptyPayload,
    #[error("Invalid XML structure")]
    NotXml,
    #[error("{format} parsing failed: {detail}")]
    Malformed { format: &'static str, detail: String },
}

/// Single-entry failure. Logged and counted, never fails the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("{field} is not an integer: {value:?}")]
    NotInteger { field: &'static str, value: String },
    #[error("undecodable text in {0}")]
    Encoding(&'static str),
}

/// Records that passed validation plus the counts used for quality scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBatch<T> {
    pub records: Vec<T>,
    pub valid: usize,
    pub total: usize,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            valid: 0,
            total: 0,
        }
    }
}

impl<T> ParsedBatch<T> {
    pub fn quality(&self) -> DataQuality {
        assess_quality(self.valid, self.total)
    }

    fn accept(&mut self, record: T) {
        self.total += 1;
        self.valid += 1;
        self.records.push(record);
    }

    fn reject(&mut self) {
        self.total += 1;
    }
}

pub type ParsedForecasts = ParsedBatch<ForecastRecord>;
pub type ParsedAlerts = ParsedBatch<AlertRecord>;

pub trait SourceAdapter: Send + Sync {
    type Record: Send;

    fn source_id(&self) -> &'static str;

    fn parse(
        &self,
        payload: &[u8],
        ctx: &AdapterContext,
    ) -> Result<ParsedBatch<Self::Record>, ValidationError>;
}

pub fn forecast_adapter() -> AnmForecastAdapter {
    AnmForecastAdapter
}

pub fn alert_adapter() -> AnmAlertAdapter {
    AnmAlertAdapter
}

/// Strip a `prefix:` from a qualified element or attribute name.
fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}
