//! Pattern detectors over one device's ordered readings.
//!
//! These complement the z-score flags carried on the hourly and feature rows:
//! each emits its own [`AnomalyKind`] and never feeds back into those columns.

use std::collections::BTreeMap;

use ecogrid_client::domain::{Anomaly, AnomalyKind, Reading, Severity};
use serde::Deserialize;
use time::UtcOffset;

use crate::{
    scoring::{self, SeverityLadder},
    window::{self, Dispersion},
};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Readings the line is fitted through.
    pub window: usize,
    /// Series shorter than this are not checked.
    pub min_readings: usize,
    /// The fitted slope must exceed this multiple of the window's spread.
    pub slope_ratio: f64,
    /// The reading must miss the prediction by more than this multiple of the spread.
    pub deviation_ratio: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window: 6,
            min_readings: 12,
            slope_ratio: 0.5,
            deviation_ratio: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SeasonalConfig {
    /// Series shorter than this are not checked.
    pub min_readings: usize,
    /// Readings an hour of day needs before it has a baseline.
    pub min_samples: usize,
}

impl Default for SeasonalConfig {
    fn default() -> Self {
        Self {
            min_readings: 48,
            min_samples: 3,
        }
    }
}

/// Least-squares line through `(0, ys[0]), (1, ys[1]), ...` as `(slope, intercept)`.
fn fit_line(ys: &[f64]) -> Option<(f64, f64)> {
    if ys.len() < 2 {
        return None;
    }
    let n = ys.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Readings that break sharply from the trend of the `window` readings before
/// them. Windows with a null power or no spread are skipped.
pub fn trend_anomalies(device_id: &str, readings: &[Reading], cfg: &TrendConfig) -> Vec<Anomaly> {
    let w = cfg.window;
    if w < 2 || readings.len() < cfg.min_readings.max(w + 1) {
        return Vec::new();
    }

    let power: Vec<Option<f64>> = readings.iter().map(|r| r.power_w).collect();
    let mut out = Vec::new();

    for i in w..readings.len() {
        let Some(actual) = power[i] else { continue };
        let Some(prev) = power[i - w..i].iter().copied().collect::<Option<Vec<f64>>>() else {
            continue;
        };
        let Some(std) = window::stats(&prev, Dispersion::Population).std else {
            continue;
        };
        if std <= 0.0 {
            continue;
        }
        let Some((slope, intercept)) = fit_line(&prev) else {
            continue;
        };
        if slope.abs() <= std * cfg.slope_ratio {
            continue;
        }

        let predicted = slope * w as f64 + intercept;
        let deviation = (actual - predicted).abs();
        if deviation > std * cfg.deviation_ratio {
            out.push(scoring::anomaly(
                device_id,
                readings[i].ts,
                AnomalyKind::Trend,
                actual,
                Some(predicted),
                deviation / std,
                Severity::Medium,
            ));
        }
    }
    out
}

/// Readings far from the mean power of their UTC hour of day across the
/// whole series. Only medium and high tiers are reported.
pub fn seasonal_anomalies(
    device_id: &str,
    readings: &[Reading],
    cfg: &SeasonalConfig,
    ladder: &SeverityLadder,
) -> Vec<Anomaly> {
    if readings.len() < cfg.min_readings {
        return Vec::new();
    }

    let hour_of = |r: &Reading| r.ts.to_offset(UtcOffset::UTC).hour();

    let mut by_hour: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    for r in readings {
        if let Some(p) = r.power_w {
            by_hour.entry(hour_of(r)).or_default().push(p);
        }
    }
    let baselines: BTreeMap<u8, (f64, f64)> = by_hour
        .into_iter()
        .filter(|(_, values)| values.len() >= cfg.min_samples)
        .filter_map(|(hour, values)| {
            let s = window::stats(&values, Dispersion::Population);
            Some((hour, (s.avg?, s.std?)))
        })
        .collect();

    readings
        .iter()
        .filter_map(|r| {
            let power = r.power_w?;
            let &(mean, std) = baselines.get(&hour_of(r))?;
            if std <= 0.0 {
                return None;
            }
            let z = (power - mean).abs() / std;
            let severity = ladder.classify(z);
            (severity >= Severity::Medium).then(|| {
                scoring::anomaly(device_id, r.ts, AnomalyKind::Seasonal, power, Some(mean), z, severity)
            })
        })
        .collect()
}
