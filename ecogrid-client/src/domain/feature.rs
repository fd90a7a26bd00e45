use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One row of `ml_features`, at reading granularity.
///
/// Lags and deltas are reading-count offsets, not elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub power_w: Option<f64>,
    pub energy_wh: Option<f64>,

    pub hour_of_day: u8,
    /// Monday = 0.
    pub day_of_week: u8,
    pub month: u8,
    pub is_weekend: bool,
    pub is_holiday: bool,

    pub lag_1: Option<f64>,
    pub lag_12: Option<f64>,
    pub lag_24: Option<f64>,
    pub rolling_avg_1h: Option<f64>,
    pub rolling_std_1h: Option<f64>,
    pub rolling_avg_24: Option<f64>,
    pub rolling_std_24: Option<f64>,
    pub energy_delta_1: Option<f64>,
    pub energy_delta_12: Option<f64>,
    pub energy_delta_24: Option<f64>,

    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

impl FeatureRow {
    /// True once every lag column is populated.
    pub fn has_full_lags(&self) -> bool {
        self.lag_1.is_some() && self.lag_12.is_some() && self.lag_24.is_some()
    }
}
