use ecogrid_client::domain::{HourlyAggregate, Reading, Severity};
use time::OffsetDateTime;

use super::{hour_bucket, mean, sum};
use crate::{
    config::{AnalyticsConfig, ThresholdConfig},
    scoring, window,
};

/// Offsets of the hourly lag columns, in buckets.
pub const HOURLY_LAGS: (usize, usize) = (1, 24);

/// Roll one device's readings up into hourly buckets and score each bucket
/// against the trailing hourly window.
///
/// `readings` must be sorted by timestamp.
pub fn hourly_aggregates(
    device_id: &str,
    readings: &[Reading],
    cfg: &AnalyticsConfig,
) -> Vec<HourlyAggregate> {
    let mut rows: Vec<HourlyAggregate> = group_by_hour(readings)
        .into_iter()
        .map(|(hour_ts, bucket)| summarize_hour(device_id, hour_ts, bucket, &cfg.thresholds))
        .collect();

    let avg_power: Vec<Option<f64>> = rows.iter().map(|r| r.avg_power_w).collect();
    let stats = window::rolling(&avg_power, cfg.windows.hourly, cfg.windows.dispersion);
    let lag_1 = window::lag(&avg_power, HOURLY_LAGS.0);
    let lag_24 = window::lag(&avg_power, HOURLY_LAGS.1);

    for (i, row) in rows.iter_mut().enumerate() {
        let z = scoring::z_score(row.avg_power_w, &stats[i]);
        row.rolling_avg_24 = stats[i].avg;
        row.rolling_std_24 = stats[i].std;
        row.power_lag_1 = lag_1[i];
        row.power_lag_24 = lag_24[i];
        row.z_score = z;
        row.is_anomaly = z > cfg.thresholds.hourly_z;
        row.severity = cfg.severity.classify(z);
    }

    rows
}

fn group_by_hour(readings: &[Reading]) -> Vec<(OffsetDateTime, &[Reading])> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < readings.len() {
        let hour = hour_bucket(readings[start].ts);
        let len = readings[start..]
            .iter()
            .take_while(|r| hour_bucket(r.ts) == hour)
            .count();
        out.push((hour, &readings[start..start + len]));
        start += len;
    }
    out
}

fn summarize_hour(
    device_id: &str,
    hour_ts: OffsetDateTime,
    bucket: &[Reading],
    t: &ThresholdConfig,
) -> HourlyAggregate {
    let power: Vec<f64> = bucket.iter().filter_map(|r| r.power_w).collect();
    let avg_power = mean(power.iter().copied());

    // Compared against an average that includes the reading itself.
    let anomaly_count = avg_power
        .map(|avg| power.iter().filter(|p| **p > t.spike_multiplier * avg).count())
        .unwrap_or(0);

    HourlyAggregate {
        device_id: device_id.to_string(),
        hour_ts,
        reading_count: bucket.len() as u32,
        avg_power_w: avg_power,
        max_power_w: power.iter().copied().reduce(f64::max),
        min_power_w: power.iter().copied().reduce(f64::min),
        total_energy_wh: sum(bucket.iter().filter_map(|r| r.energy_wh)),
        high_power_events: power.iter().filter(|p| **p > t.high_power_w).count() as u32,
        avg_voltage: mean(bucket.iter().filter_map(|r| r.voltage)),
        avg_temp_c: mean(bucket.iter().filter_map(|r| r.temp_c)),
        occupancy_rate: mean(
            bucket
                .iter()
                .filter_map(|r| r.occupancy)
                .map(|o| if o { 1.0 } else { 0.0 }),
        ),
        anomaly_count: anomaly_count as u32,
        rolling_avg_24: None,
        rolling_std_24: None,
        power_lag_1: None,
        power_lag_24: None,
        z_score: 0.0,
        is_anomaly: false,
        severity: Severity::Normal,
    }
}
