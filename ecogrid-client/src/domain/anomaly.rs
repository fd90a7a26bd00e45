use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Severity tier derived from a z-score. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Whether this tier is surfaced as an anomaly at all.
    pub fn is_surfaced(&self) -> bool {
        *self != Self::Normal
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which signal produced an anomaly record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Hourly average power against the trailing hourly window.
    HourlyZscore,
    /// Instantaneous power against the trailing reading window.
    ReadingZscore,
    /// A reading far off the line fitted through the readings just before it.
    Trend,
    /// A reading far from the usual power for its hour of day.
    Seasonal,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HourlyZscore => "hourly_zscore",
            Self::ReadingZscore => "reading_zscore",
            Self::Trend => "trend",
            Self::Seasonal => "seasonal",
        }
    }
}

/// One row of `anomalies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Stable across recomputes of the same input.
    pub anomaly_id: String,
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// The baseline the observation was compared against: a window average,
    /// the trend prediction or the hour-of-day mean.
    pub original_value: Option<f64>,
    pub observed_value: f64,
    pub z_score: f64,
    pub confidence: f64,
    pub explanation: String,
}
