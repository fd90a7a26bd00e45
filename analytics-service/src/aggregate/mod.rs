//! Hourly and daily rollups of a device's readings.

pub mod daily;
pub mod hourly;

pub use daily::daily_aggregates;
pub use hourly::hourly_aggregates;

use serde::Deserialize;
use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Energy price and grid emission factor used for daily cost/carbon estimates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Tariff {
    pub rate_per_kwh: f64,
    pub emission_factor_kg_per_kwh: f64,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            rate_per_kwh: 0.12,
            emission_factor_kg_per_kwh: 0.4,
        }
    }
}

impl Tariff {
    pub fn cost_usd(&self, energy_wh: f64) -> f64 {
        energy_wh / 1000.0 * self.rate_per_kwh
    }

    pub fn carbon_kg(&self, energy_wh: f64) -> f64 {
        energy_wh / 1000.0 * self.emission_factor_kg_per_kwh
    }
}

/// Truncate to the start of the UTC hour.
pub fn hour_bucket(ts: OffsetDateTime) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    utc.replace_time(Time::MIDNIGHT) + Duration::hours(i64::from(utc.hour()))
}

pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Sum of the present values; null when there are none, as SQL `SUM` does.
pub(crate) fn sum(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}
