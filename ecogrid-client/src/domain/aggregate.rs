use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use super::Severity;

/// One row of `analytics_hourly`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub hour_ts: OffsetDateTime,
    pub reading_count: u32,
    pub avg_power_w: Option<f64>,
    pub max_power_w: Option<f64>,
    pub min_power_w: Option<f64>,
    pub total_energy_wh: Option<f64>,
    /// Readings above the high-power threshold.
    pub high_power_events: u32,
    pub avg_voltage: Option<f64>,
    pub avg_temp_c: Option<f64>,
    pub occupancy_rate: Option<f64>,
    /// Readings whose power exceeds the spike multiple of this hour's own average.
    pub anomaly_count: u32,
    pub rolling_avg_24: Option<f64>,
    pub rolling_std_24: Option<f64>,
    pub power_lag_1: Option<f64>,
    pub power_lag_24: Option<f64>,
    /// Cross-hour z-score of `avg_power_w` against the trailing window.
    pub z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
}

/// One row of `analytics_daily`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub device_id: String,
    pub date: Date,
    pub hour_count: u32,
    pub total_energy_wh: Option<f64>,
    pub avg_power_w: Option<f64>,
    pub peak_power_w: Option<f64>,
    pub peak_hour: Option<u8>,
    pub low_power_hours: u32,
    /// Hours whose average exceeds the spike multiple of the daily average.
    pub anomaly_count: u32,
    pub cost_usd: Option<f64>,
    pub carbon_kg: Option<f64>,
}
