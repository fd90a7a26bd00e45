use ecogrid_client::domain::{
    Anomaly, AnomalyKind, DailyAggregate, FeatureRow, HourlyAggregate, Reading,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::{
    aggregate::{daily_aggregates, hourly_aggregates},
    config::AnalyticsConfig,
    detectors::{seasonal_anomalies, trend_anomalies},
    features::feature_rows,
    scoring, views,
};

/// Everything derived from one device's readings in a single recompute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTables {
    pub device_id: String,
    pub hourly: Vec<HourlyAggregate>,
    pub daily: Vec<DailyAggregate>,
    pub features: Vec<FeatureRow>,
    pub anomalies: Vec<Anomaly>,
    pub current_usage: Option<Reading>,
    /// Validated readings that fed the tables.
    pub reading_count: usize,
    /// Readings of this device dropped by validation.
    pub rejected: u64,
}

/// Recompute all derived tables of one device from scratch.
///
/// Readings outside `[as_of - horizon_days, as_of]` are ignored, and the rest
/// are ordered by `(ts, ingest_seq)` before anything is derived from them.
pub fn compute_partition(
    device_id: String,
    mut readings: Vec<Reading>,
    rejected: u64,
    cfg: &AnalyticsConfig,
    as_of: OffsetDateTime,
) -> DeviceTables {
    let start = as_of - Duration::days(cfg.horizon_days);
    readings.retain(|r| r.ts >= start && r.ts <= as_of);
    readings.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.ingest_seq.cmp(&b.ingest_seq)));

    let hourly = hourly_aggregates(&device_id, &readings, cfg);
    let daily = daily_aggregates(&hourly, cfg);
    let features = feature_rows(&device_id, &readings, cfg);
    let anomalies = detect_anomalies(&device_id, &readings, &hourly, &features, cfg);
    let current_usage = views::current_usage(&readings, as_of).cloned();

    DeviceTables {
        device_id,
        hourly,
        daily,
        features,
        anomalies,
        current_usage,
        reading_count: readings.len(),
        rejected,
    }
}

fn detect_anomalies(
    device_id: &str,
    readings: &[Reading],
    hourly: &[HourlyAggregate],
    features: &[FeatureRow],
    cfg: &AnalyticsConfig,
) -> Vec<Anomaly> {
    let ladder = &cfg.severity;

    let from_hours = hourly.iter().filter(|h| h.is_anomaly).filter_map(|h| {
        let observed = h.avg_power_w?;
        Some(scoring::anomaly(
            device_id,
            h.hour_ts,
            AnomalyKind::HourlyZscore,
            observed,
            h.rolling_avg_24,
            h.z_score,
            ladder.classify(h.z_score),
        ))
    });

    let from_readings = features.iter().filter(|f| f.is_anomaly).filter_map(|f| {
        let observed = f.power_w?;
        Some(scoring::anomaly(
            device_id,
            f.ts,
            AnomalyKind::ReadingZscore,
            observed,
            f.rolling_avg_24,
            f.anomaly_score,
            ladder.classify(f.anomaly_score),
        ))
    });

    let mut anomalies: Vec<Anomaly> = from_hours.chain(from_readings).collect();
    anomalies.extend(trend_anomalies(device_id, readings, &cfg.trend));
    anomalies.extend(seasonal_anomalies(device_id, readings, &cfg.seasonal, ladder));
    anomalies.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.kind.cmp(&b.kind)));
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecogrid_client::domain::Severity;
    use time::macros::datetime;

    fn reading(ts: OffsetDateTime, power: f64, seq: u64) -> Reading {
        Reading {
            ts,
            device_id: "D1".to_string(),
            power_w: Some(power),
            energy_wh: Some(power / 12.0),
            voltage: Some(230.0),
            temp_c: None,
            occupancy: None,
            ingest_seq: seq,
        }
    }

    #[test]
    fn hourly_spike_produces_a_high_anomaly() {
        let base = datetime!(2024-03-01 00:00:00 UTC);
        let mut readings: Vec<Reading> = (0..24)
            .map(|h| reading(base + Duration::hours(h), 100.0, h as u64))
            .collect();
        readings[23].power_w = Some(500.0);
        let as_of = base + Duration::hours(23);

        let t = compute_partition("D1".into(), readings, 0, &AnalyticsConfig::default(), as_of);

        assert_eq!(t.hourly.len(), 24);
        let hourly: Vec<_> = t
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::HourlyZscore)
            .collect();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].severity, Severity::High);
        assert_eq!(hourly[0].observed_value, 500.0);
        assert!(hourly[0].confidence > 0.0 && hourly[0].confidence < 1.0);
    }

    #[test]
    fn pattern_detectors_add_their_own_records() {
        let base = datetime!(2024-03-01 00:00:00 UTC);
        let mut readings: Vec<Reading> = (0..7 * 24)
            .map(|h| reading(base + Duration::hours(h), 100.0 + (h % 24) as f64, h as u64))
            .collect();
        readings[6 * 24 + 14].power_w = Some(400.0);
        let as_of = base + Duration::days(7);

        let t = compute_partition("D1".into(), readings, 0, &AnalyticsConfig::default(), as_of);

        let seasonal: Vec<_> = t
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::Seasonal)
            .collect();
        assert_eq!(seasonal.len(), 1);
        assert_eq!(seasonal[0].ts, base + Duration::hours(6 * 24 + 14));
        assert!(t.anomalies.iter().all(|a| !a.explanation.is_empty()));
        assert!(t
            .anomalies
            .windows(2)
            .all(|w| (w[0].ts, w[0].kind) <= (w[1].ts, w[1].kind)));
    }

    #[test]
    fn input_order_does_not_change_the_result() {
        let base = datetime!(2024-03-01 00:00:00 UTC);
        let readings: Vec<Reading> = (0..48)
            .map(|i| reading(base + Duration::minutes(5 * i), 100.0 + (i % 7) as f64 * 40.0, i as u64))
            .collect();
        let mut shuffled = readings.clone();
        shuffled.reverse();
        shuffled.swap(3, 17);
        let as_of = base + Duration::hours(4);
        let cfg = AnalyticsConfig::default();

        let a = compute_partition("D1".into(), readings, 0, &cfg, as_of);
        let b = compute_partition("D1".into(), shuffled, 0, &cfg, as_of);
        assert_eq!(a, b);
    }

    #[test]
    fn readings_outside_the_horizon_are_ignored() {
        let as_of = datetime!(2024-03-31 12:00:00 UTC);
        let readings = vec![
            reading(as_of - Duration::days(31), 100.0, 0),
            reading(as_of - Duration::hours(1), 100.0, 1),
            reading(as_of + Duration::hours(1), 100.0, 2),
        ];

        let t = compute_partition("D1".into(), readings, 2, &AnalyticsConfig::default(), as_of);
        assert_eq!(t.reading_count, 1);
        assert_eq!(t.features.len(), 1);
        assert_eq!(t.rejected, 2);
    }

    #[test]
    fn empty_partition_yields_empty_tables() {
        let t = compute_partition(
            "D1".into(),
            Vec::new(),
            0,
            &AnalyticsConfig::default(),
            datetime!(2024-03-01 00:00:00 UTC),
        );
        assert!(t.hourly.is_empty() && t.daily.is_empty() && t.features.is_empty());
        assert!(t.anomalies.is_empty());
        assert!(t.current_usage.is_none());
    }
}
