//! Read-side projections over the recomputed tables.
//!
//! Views are derived, never stored independently: each recompute rebuilds
//! them from the device tables of that run.

use ecogrid_client::domain::{DeviceMetadata, FeatureRow, Reading, Severity};
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{config::AnalyticsConfig, pipeline::DeviceTables, scoring};

/// Latest reading on the UTC calendar day of `as_of`, not after `as_of`.
///
/// Ties on `ts` go to the reading that arrived last.
pub fn current_usage(readings: &[Reading], as_of: OffsetDateTime) -> Option<&Reading> {
    let today = as_of.to_offset(UtcOffset::UTC).date();
    readings
        .iter()
        .filter(|r| r.ts <= as_of && r.ts.to_offset(UtcOffset::UTC).date() == today)
        .max_by_key(|r| (r.ts, r.ingest_seq))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub location: Option<String>,
    pub capacity_w: Option<f64>,
    pub status: String,
    pub current_power_w: Option<f64>,
    pub current_energy_wh: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_ts: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_hour_ts: Option<OffsetDateTime>,
    pub last_hour_avg_power_w: Option<f64>,
    pub last_hour_anomaly_count: Option<u32>,
}

/// Active devices joined with their current reading and the most recent
/// hourly bucket inside the realtime window. Sorted by device id.
pub fn device_summary(
    devices: &[DeviceMetadata],
    tables: &[DeviceTables],
    as_of: OffsetDateTime,
    realtime_hours: i64,
) -> Vec<DeviceSummary> {
    let since = as_of - Duration::hours(realtime_hours);

    let mut out: Vec<DeviceSummary> = devices
        .iter()
        .filter(|d| d.is_active())
        .map(|d| {
            let t = tables.iter().find(|t| t.device_id == d.device_id);
            let current = t.and_then(|t| t.current_usage.as_ref());
            let last_hour = t.and_then(|t| {
                t.hourly
                    .iter()
                    .rev()
                    .find(|h| h.hour_ts >= since && h.hour_ts <= as_of)
            });

            DeviceSummary {
                device_id: d.device_id.clone(),
                device_name: d.device_name.clone(),
                device_type: d.device_type.clone(),
                location: d.location.clone(),
                capacity_w: d.capacity_w,
                status: d.status.clone(),
                current_power_w: current.and_then(|r| r.power_w),
                current_energy_wh: current.and_then(|r| r.energy_wh),
                last_reading_ts: current.map(|r| r.ts),
                last_hour_ts: last_hour.map(|h| h.hour_ts),
                last_hour_avg_power_w: last_hour.and_then(|h| h.avg_power_w),
                last_hour_anomaly_count: last_hour.map(|h| h.anomaly_count),
            }
        })
        .collect();

    out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeAnomaly {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub power_w: Option<f64>,
    pub rolling_avg_24: Option<f64>,
    pub anomaly_score: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub is_anomaly: bool,
}

/// Feature rows of the realtime window scoring above the lowest severity tier,
/// newest first; equal timestamps are ordered by device id.
pub fn realtime_anomalies(
    tables: &[DeviceTables],
    as_of: OffsetDateTime,
    cfg: &AnalyticsConfig,
) -> Vec<RealtimeAnomaly> {
    let since = as_of - Duration::hours(cfg.realtime_hours);
    let ladder = &cfg.severity;

    let mut out: Vec<RealtimeAnomaly> = tables
        .iter()
        .flat_map(|t| t.features.iter())
        .filter(|f| f.ts >= since && f.ts <= as_of)
        .filter(|f| ladder.classify(f.anomaly_score).is_surfaced())
        .map(|f| RealtimeAnomaly {
            device_id: f.device_id.clone(),
            ts: f.ts,
            power_w: f.power_w,
            rolling_avg_24: f.rolling_avg_24,
            anomaly_score: f.anomaly_score,
            severity: ladder.classify(f.anomaly_score),
            confidence: scoring::confidence(f.anomaly_score),
            is_anomaly: f.is_anomaly,
        })
        .collect();

    out.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.device_id.cmp(&b.device_id)));
    out
}

/// Feature rows of the training window with every lag populated, ordered by
/// `(device_id, ts)`.
pub fn training_data(
    tables: &[DeviceTables],
    as_of: OffsetDateTime,
    training_days: i64,
) -> Vec<FeatureRow> {
    let since = as_of - Duration::days(training_days);
    let mut out: Vec<FeatureRow> = tables
        .iter()
        .flat_map(|t| t.features.iter())
        .filter(|f| f.ts >= since && f.ts <= as_of && f.has_full_lags())
        .cloned()
        .collect();
    out.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.ts.cmp(&b.ts)));
    out
}

/// All views of one recompute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Views {
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub current_usage: Vec<Reading>,
    pub device_summary: Vec<DeviceSummary>,
    pub realtime_anomalies: Vec<RealtimeAnomaly>,
    pub training_data: Vec<FeatureRow>,
}

impl Views {
    pub fn build(
        tables: &[DeviceTables],
        devices: &[DeviceMetadata],
        as_of: OffsetDateTime,
        cfg: &AnalyticsConfig,
    ) -> Self {
        let mut current: Vec<Reading> = tables
            .iter()
            .filter_map(|t| t.current_usage.clone())
            .collect();
        current.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        Self {
            as_of,
            current_usage: current,
            device_summary: device_summary(devices, tables, as_of, cfg.realtime_hours),
            realtime_anomalies: realtime_anomalies(tables, as_of, cfg),
            training_data: training_data(tables, as_of, cfg.training_days),
        }
    }
}
