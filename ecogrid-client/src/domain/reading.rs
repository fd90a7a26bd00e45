use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A reading as it sits in `raw_readings`, before validation.
///
/// Every column is nullable here; rows missing `device_id` or `ts` are rejected
/// by the analytics pipeline rather than dropped on load.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(default, alias = "timestamp", with = "time::serde::rfc3339::option")]
    pub ts: Option<OffsetDateTime>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub power_w: Option<f64>,
    #[serde(default)]
    pub energy_wh: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub temp_c: Option<f64>,
    #[serde(default)]
    pub occupancy: Option<bool>,
}

/// A validated reading, ordered within its device by `(ts, ingest_seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub device_id: String,
    pub power_w: Option<f64>,
    pub energy_wh: Option<f64>,
    pub voltage: Option<f64>,
    pub temp_c: Option<f64>,
    pub occupancy: Option<bool>,
    /// Arrival order in the store. Breaks ties between equal timestamps.
    pub ingest_seq: u64,
}
