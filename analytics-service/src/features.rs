//! Per-reading feature table consumed by the forecasting model.

use ecogrid_client::domain::{FeatureRow, Reading};
use serde::Deserialize;
use time::{Date, Month, OffsetDateTime, UtcOffset, Weekday};

use crate::{config::AnalyticsConfig, scoring, window};

/// Reading offsets of the lag and energy-delta columns.
pub const FEATURE_LAGS: [usize; 3] = [1, 12, 24];

/// A recurring holiday, written `"MM-DD"` in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct MonthDay {
    pub month: Month,
    pub day: u8,
}

impl TryFrom<String> for MonthDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (m, d) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("invalid month-day '{s}', expected MM-DD"))?;
        let month: u8 = m.parse().map_err(|e| format!("invalid month in '{s}': {e}"))?;
        let month = Month::try_from(month).map_err(|e| format!("invalid month in '{s}': {e}"))?;
        let day: u8 = d.parse().map_err(|e| format!("invalid day in '{s}': {e}"))?;
        // 2024 is a leap year, so Feb 29 is accepted.
        Date::from_calendar_date(2024, month, day).map_err(|e| format!("invalid day in '{s}': {e}"))?;
        Ok(Self { month, day })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HolidayCalendar {
    /// Holidays that fall on the same day every year.
    pub fixed: Vec<MonthDay>,
    /// One-off dates, e.g. a moving holiday for a specific year.
    pub dates: Vec<Date>,
}

impl Default for HolidayCalendar {
    fn default() -> Self {
        Self {
            fixed: vec![MonthDay {
                month: Month::December,
                day: 25,
            }],
            dates: Vec::new(),
        }
    }
}

impl HolidayCalendar {
    pub fn is_holiday(&self, date: Date) -> bool {
        self.fixed
            .iter()
            .any(|md| md.month == date.month() && md.day == date.day())
            || self.dates.contains(&date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFeatures {
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub month: u8,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

pub fn calendar_features(ts: OffsetDateTime, holidays: &HolidayCalendar) -> CalendarFeatures {
    let utc = ts.to_offset(UtcOffset::UTC);
    let weekday = utc.weekday();
    CalendarFeatures {
        hour_of_day: utc.hour(),
        day_of_week: weekday.number_days_from_monday(),
        month: u8::from(utc.month()),
        is_weekend: matches!(weekday, Weekday::Saturday | Weekday::Sunday),
        is_holiday: holidays.is_holiday(utc.date()),
    }
}

/// One feature row per reading, in reading order.
pub fn feature_rows(device_id: &str, readings: &[Reading], cfg: &AnalyticsConfig) -> Vec<FeatureRow> {
    let power: Vec<Option<f64>> = readings.iter().map(|r| r.power_w).collect();
    let energy: Vec<Option<f64>> = readings.iter().map(|r| r.energy_wh).collect();

    let [l1, l12, l24] = FEATURE_LAGS;
    let (lag_1, lag_12, lag_24) = (
        window::lag(&power, l1),
        window::lag(&power, l12),
        window::lag(&power, l24),
    );
    let (delta_1, delta_12, delta_24) = (
        window::delta(&energy, l1),
        window::delta(&energy, l12),
        window::delta(&energy, l24),
    );
    let short = window::rolling(&power, cfg.windows.short, cfg.windows.dispersion);
    let long = window::rolling(&power, cfg.windows.long, cfg.windows.dispersion);

    readings
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let cal = calendar_features(r.ts, &cfg.holidays);
            let score = scoring::z_score(r.power_w, &long[i]);
            FeatureRow {
                device_id: device_id.to_string(),
                ts: r.ts,
                power_w: r.power_w,
                energy_wh: r.energy_wh,
                hour_of_day: cal.hour_of_day,
                day_of_week: cal.day_of_week,
                month: cal.month,
                is_weekend: cal.is_weekend,
                is_holiday: cal.is_holiday,
                lag_1: lag_1[i],
                lag_12: lag_12[i],
                lag_24: lag_24[i],
                rolling_avg_1h: short[i].avg,
                rolling_std_1h: short[i].std,
                rolling_avg_24: long[i].avg,
                rolling_std_24: long[i].std,
                energy_delta_1: delta_1[i],
                energy_delta_12: delta_12[i],
                energy_delta_24: delta_24[i],
                anomaly_score: score,
                is_anomaly: score > cfg.thresholds.reading_z,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{
        macros::{date, datetime},
        Duration,
    };

    fn readings(n: usize) -> Vec<Reading> {
        let start = datetime!(2024-03-01 00:00:00 UTC);
        (0..n)
            .map(|i| Reading {
                ts: start + Duration::minutes(5 * i as i64),
                device_id: "D1".to_string(),
                power_w: Some(100.0 + i as f64),
                energy_wh: Some(10.0 * i as f64),
                voltage: None,
                temp_c: None,
                occupancy: None,
                ingest_seq: i as u64,
            })
            .collect()
    }

    #[test]
    fn calendar_features_from_timestamp() {
        let holidays = HolidayCalendar::default();

        // Saturday.
        let sat = calendar_features(datetime!(2024-03-02 14:30:00 UTC), &holidays);
        assert_eq!(sat.hour_of_day, 14);
        assert_eq!(sat.day_of_week, 5);
        assert_eq!(sat.month, 3);
        assert!(sat.is_weekend);
        assert!(!sat.is_holiday);

        // Wednesday, Christmas.
        let xmas = calendar_features(datetime!(2024-12-25 08:00:00 UTC), &holidays);
        assert_eq!(xmas.day_of_week, 2);
        assert!(!xmas.is_weekend);
        assert!(xmas.is_holiday);
    }

    #[test]
    fn extra_holiday_dates_extend_the_calendar() {
        let holidays = HolidayCalendar {
            fixed: vec![MonthDay::try_from("01-01".to_string()).unwrap()],
            dates: vec![date!(2024-11-28)],
        };
        assert!(holidays.is_holiday(date!(2025-01-01)));
        assert!(holidays.is_holiday(date!(2024-11-28)));
        assert!(!holidays.is_holiday(date!(2025-11-28)));
        assert!(!holidays.is_holiday(date!(2024-12-25)));
    }

    #[test]
    fn month_day_rejects_garbage() {
        assert!(MonthDay::try_from("13-01".to_string()).is_err());
        assert!(MonthDay::try_from("02-30".to_string()).is_err());
        assert!(MonthDay::try_from("christmas".to_string()).is_err());
        assert!(MonthDay::try_from("02-29".to_string()).is_ok());
    }

    #[test]
    fn three_readings_have_rows_with_null_long_lags() {
        let rows = feature_rows("D1", &readings(3), &AnalyticsConfig::default());
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.lag_12.is_none() && r.lag_24.is_none()));
        assert_eq!(rows[2].lag_1, Some(101.0));
        assert!(rows.iter().all(|r| !r.has_full_lags()));
    }

    #[test]
    fn lags_and_deltas_use_reading_offsets() {
        let rows = feature_rows("D1", &readings(30), &AnalyticsConfig::default());

        let r = &rows[29];
        assert_eq!(r.lag_1, Some(128.0));
        assert_eq!(r.lag_12, Some(117.0));
        assert_eq!(r.lag_24, Some(105.0));
        assert_eq!(r.energy_delta_1, Some(10.0));
        assert_eq!(r.energy_delta_12, Some(120.0));
        assert_eq!(r.energy_delta_24, Some(240.0));
        assert!(r.has_full_lags());
        assert!(!rows[23].has_full_lags());
        assert!(rows[24].has_full_lags());
    }

    #[test]
    fn short_and_long_windows_are_independent() {
        let rows = feature_rows("D1", &readings(30), &AnalyticsConfig::default());
        // Short window: readings 18..=29 -> 118..=129.
        assert_eq!(rows[29].rolling_avg_1h, Some(123.5));
        // Long window: readings 6..=29 -> 106..=129.
        assert_eq!(rows[29].rolling_avg_24, Some(117.5));
    }

    #[test]
    fn reading_level_spike_is_scored_against_the_long_window() {
        let mut rs = readings(24);
        for r in rs.iter_mut() {
            r.power_w = Some(100.0);
        }
        rs[23].power_w = Some(500.0);

        let rows = feature_rows("D1", &rs, &AnalyticsConfig::default());
        assert!(rows[..23].iter().all(|r| r.anomaly_score == 0.0));
        assert!(rows[23].anomaly_score > 3.0);
        assert!(rows[23].is_anomaly);
    }
}
